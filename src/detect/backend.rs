use image::RgbImage;

use crate::detect::result::Detection;
use crate::error::{InferenceError, StageError};

/// A captured image that passed decoding.
///
/// Backends receive both the encoded file bytes and the decoded RGB
/// pixels so each can pick whichever its runtime wants.
pub struct CapturedImage {
    bytes: Vec<u8>,
    rgb: RgbImage,
}

impl CapturedImage {
    /// Decode encoded bytes. Corrupt or unsupported content is a validation failure.
    pub fn decode(bytes: Vec<u8>) -> Result<Self, StageError> {
        let decoded = image::load_from_memory(&bytes)?;
        Ok(Self {
            bytes,
            rgb: decoded.to_rgb8(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }
}

/// Object-detection engine contract.
///
/// `detect` returns raw detections in engine order; thresholding and
/// suppression happen downstream. Each worker owns its own backend instance,
/// which is why `detect` may take `&mut self`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one image.
    fn detect(&mut self, image: &CapturedImage) -> Result<Vec<Detection>, InferenceError>;

    /// Optional warm-up hook, run once per worker before it takes work.
    fn warm_up(&mut self) -> Result<(), InferenceError> {
        Ok(())
    }
}
