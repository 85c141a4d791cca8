use std::path::PathBuf;

pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

/// Settings for the ONNX backend. Present in every build so configuration
/// parses the same way with or without the `backend-tract` feature.
#[derive(Clone, Debug, PartialEq)]
pub struct TractConfig {
    pub model_path: PathBuf,
    /// Square model input edge in pixels.
    pub input_size: u32,
    /// Index-aligned class names. Missing entries render as `class_<n>`.
    pub class_names: Vec<String>,
    /// Per-image inference budget; exceeding it is a transient failure.
    pub timeout_ms: Option<u64>,
}

impl TractConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            input_size: 640,
            class_names: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn class_name(&self, index: usize) -> String {
        self.class_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", index))
    }
}
