use crate::detect::backend::{CapturedImage, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};
use crate::error::InferenceError;

/// Deterministic backend for tests and dry runs.
///
/// Returns the same scripted detections for every image, clipped to the
/// image bounds. With no script it reports nothing.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    detections: Vec<Detection>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            calls: 0,
        }
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &CapturedImage) -> Result<Vec<Detection>, InferenceError> {
        self.calls += 1;
        let (w, h) = (image.width() as f32, image.height() as f32);
        Ok(self
            .detections
            .iter()
            .map(|det| {
                let b = det.bbox;
                Detection::new(
                    det.label.clone(),
                    det.confidence,
                    BoundingBox::new(
                        b.x_min.clamp(0.0, w),
                        b.y_min.clamp(0.0, h),
                        b.x_max.clamp(0.0, w),
                        b.y_max.clamp(0.0, h),
                    ),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::new(width, height)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn default_stub_reports_nothing() {
        let image = CapturedImage::decode(png(8, 8)).unwrap();
        let mut backend = StubBackend::new();
        assert!(backend.detect(&image).unwrap().is_empty());
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn scripted_boxes_are_clipped_to_image() {
        let image = CapturedImage::decode(png(16, 16)).unwrap();
        let mut backend = StubBackend::with_detections(vec![Detection::new(
            "mosquito",
            0.8,
            BoundingBox::new(-4.0, 2.0, 40.0, 12.0),
        )]);
        let out = backend.detect(&image).unwrap();
        assert_eq!(out[0].bbox, BoundingBox::new(0.0, 2.0, 16.0, 12.0));
    }
}
