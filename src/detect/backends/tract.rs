#![cfg(feature = "backend-tract")]

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use super::TractConfig;
use crate::detect::backend::{CapturedImage, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};
use crate::error::InferenceError;

/// Candidates scoring below this never leave the backend.
const MIN_SCORE: f32 = 1e-3;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` where each
/// anchor carries `cx, cy, w, h` in model-input pixels followed by one score
/// per class. Boxes are scaled back to source-image pixels.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    cfg: TractConfig,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load(cfg: &TractConfig) -> Result<Self> {
        let size = cfg.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(&cfg.model_path)
            .with_context(|| {
                format!("failed to load ONNX model from {}", cfg.model_path.display())
            })?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "loaded detector model {} ({}x{} input)",
            cfg.model_path.display(),
            size,
            size
        );
        Ok(Self {
            model,
            cfg: cfg.clone(),
        })
    }

    fn build_input(&self, image: &CapturedImage) -> Tensor {
        let size = self.cfg.input_size;
        let resized = imageops::resize(image.rgb(), size, size, FilterType::Triangle);
        let size = size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    fn decode_output(
        &self,
        outputs: TVec<TValue>,
        image: &CapturedImage,
    ) -> Result<Vec<Detection>, InferenceError> {
        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::Unavailable("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::Unavailable(format!("output tensor was not f32: {e}")))?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(InferenceError::Unavailable(format!(
                "unexpected output shape {:?}",
                shape
            )));
        }
        let (rows, anchors) = (shape[1], shape[2]);
        let scale_x = image.width() as f32 / self.cfg.input_size as f32;
        let scale_y = image.height() as f32 / self.cfg.input_size as f32;

        let mut detections = Vec::new();
        for a in 0..anchors {
            let mut best = (0usize, f32::MIN);
            for class in 0..rows - 4 {
                let score = view[[0, 4 + class, a]];
                if score > best.1 {
                    best = (class, score);
                }
            }
            if !best.1.is_finite() || best.1 < MIN_SCORE {
                continue;
            }
            let (cx, cy) = (view[[0, 0, a]], view[[0, 1, a]]);
            let (w, h) = (view[[0, 2, a]], view[[0, 3, a]]);
            let bbox = BoundingBox::new(
                ((cx - w / 2.0) * scale_x).max(0.0),
                ((cy - h / 2.0) * scale_y).max(0.0),
                ((cx + w / 2.0) * scale_x).min(image.width() as f32),
                ((cy + h / 2.0) * scale_y).min(image.height() as f32),
            );
            if !bbox.is_finite() || bbox.area() <= 0.0 {
                continue;
            }
            detections.push(Detection::new(
                self.cfg.class_name(best.0),
                best.1.min(1.0),
                bbox,
            ));
        }
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &CapturedImage) -> Result<Vec<Detection>, InferenceError> {
        let started = Instant::now();
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| InferenceError::Unavailable(format!("ONNX inference failed: {e}")))?;
        if let Some(budget) = self.cfg.timeout_ms.map(Duration::from_millis) {
            if started.elapsed() > budget {
                return Err(InferenceError::Timeout(budget));
            }
        }
        self.decode_output(outputs, image)
    }

    fn warm_up(&mut self) -> Result<(), InferenceError> {
        let size = self.cfg.input_size as usize;
        let blank = tract_ndarray::Array4::<f32>::zeros((1, 3, size, size)).into_tensor();
        self.model
            .run(tvec!(blank.into()))
            .map(|_| ())
            .map_err(|e| InferenceError::Unavailable(format!("warm-up inference failed: {e}")))
    }
}
