use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::fingerprint::Fingerprint;

/// Axis-aligned box in source-image pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x_max - self.x_min).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y_max - self.y_min).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn is_finite(&self) -> bool {
        self.x_min.is_finite()
            && self.y_min.is_finite()
            && self.x_max.is_finite()
            && self.y_max.is_finite()
    }

    /// Intersection over union; 0.0 for degenerate or disjoint boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        if !self.is_finite() || !other.is_finite() {
            return 0.0;
        }
        let ix_min = self.x_min.max(other.x_min);
        let iy_min = self.y_min.max(other.y_min);
        let ix_max = self.x_max.min(other.x_max);
        let iy_max = self.y_max.min(other.y_max);
        if ix_max <= ix_min || iy_max <= iy_min {
            return 0.0;
        }
        let intersection = (ix_max - ix_min) * (iy_max - iy_min);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 || !union.is_finite() {
            return 0.0;
        }
        (intersection / union).clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// 0..=1
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub total: usize,
    pub class_counts: BTreeMap<String, usize>,
    pub highest_confidence: f32,
    pub average_confidence: f32,
}

impl DetectionSummary {
    pub fn from_detections(detections: &[Detection]) -> Self {
        if detections.is_empty() {
            return Self::default();
        }
        let mut class_counts = BTreeMap::new();
        let mut highest = 0.0f32;
        let mut sum = 0.0f32;
        for det in detections {
            *class_counts.entry(det.label.clone()).or_insert(0) += 1;
            highest = highest.max(det.confidence);
            sum += det.confidence;
        }
        Self {
            total: detections.len(),
            class_counts,
            highest_confidence: highest,
            average_confidence: sum / detections.len() as f32,
        }
    }
}

/// Committed outcome for one fingerprint. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub fingerprint: Fingerprint,
    pub source_path: PathBuf,
    pub annotated_path: PathBuf,
    /// Confidence descending, ties in engine order.
    pub detections: Vec<Detection>,
    pub summary: DetectionSummary,
    pub processing_ms: u64,
    pub created_at_ms: u64,
}
