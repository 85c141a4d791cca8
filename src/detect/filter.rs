//! Post-processing of raw engine output.
//!
//! Order: drop non-finite and out-of-range scores, apply the confidence
//! threshold and class allowlist, run greedy NMS per class, then cap the
//! count. Output is confidence descending with ties kept in engine order.

use std::cmp::Ordering;

use crate::detect::result::Detection;

#[derive(Clone, Debug, PartialEq)]
pub struct FilterConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Keep at most this many detections per image.
    pub max_detections: Option<usize>,
    /// Empty means every class is kept.
    pub classes: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            iou_threshold: 0.5,
            max_detections: Some(10),
            classes: Vec::new(),
        }
    }
}

pub fn filter_detections(raw: Vec<Detection>, cfg: &FilterConfig) -> Vec<Detection> {
    let candidates: Vec<Detection> = raw
        .into_iter()
        .filter(|det| det.confidence.is_finite() && (0.0..=1.0).contains(&det.confidence))
        .filter(|det| det.confidence >= cfg.confidence_threshold)
        .filter(|det| cfg.classes.is_empty() || cfg.classes.iter().any(|c| *c == det.label))
        .collect();
    let mut kept = non_max_suppression(candidates, cfg.iou_threshold);
    if let Some(max) = cfg.max_detections {
        kept.truncate(max);
    }
    kept
}

/// Greedy per-class non-max suppression.
///
/// A detection is suppressed when a higher-ranked detection of the same
/// class overlaps it with IoU strictly above `iou_threshold`. Rank is
/// confidence, then earlier index.
pub fn non_max_suppression(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .partial_cmp(&detections[a].confidence)
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut suppressed = vec![false; detections.len()];
    let mut keep = Vec::new();
    for (rank, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order[rank + 1..] {
            if suppressed[j] || detections[j].label != detections[i].label {
                continue;
            }
            if detections[i].bbox.iou(&detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    let mut slots: Vec<Option<Detection>> = detections.into_iter().map(Some).collect();
    keep.into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn det(label: &str, confidence: f32, bbox: BoundingBox) -> Detection {
        Detection::new(label, confidence, bbox)
    }

    fn box_a() -> BoundingBox {
        BoundingBox::new(0.0, 0.0, 10.0, 10.0)
    }

    // IoU with box_a is 70 / 100 = 0.7
    fn box_b() -> BoundingBox {
        BoundingBox::new(0.0, 0.0, 10.0, 7.0)
    }

    #[test]
    fn overlapping_same_class_keeps_higher_confidence() {
        assert!((box_a().iou(&box_b()) - 0.7).abs() < 1e-6);
        let raw = vec![det("cat", 0.9, box_a()), det("cat", 0.85, box_b())];
        let out = filter_detections(raw, &FilterConfig::default());
        assert_eq!(out, vec![det("cat", 0.9, box_a())]);
    }

    #[test]
    fn below_threshold_leaves_empty_result() {
        let raw = vec![det("cat", 0.2, box_a())];
        assert!(filter_detections(raw, &FilterConfig::default()).is_empty());
    }

    #[test]
    fn threshold_is_inclusive() {
        let raw = vec![det("cat", 0.3, box_a())];
        assert_eq!(filter_detections(raw, &FilterConfig::default()).len(), 1);
    }

    #[test]
    fn suppression_is_per_class() {
        let raw = vec![det("cat", 0.9, box_a()), det("mosquito", 0.8, box_b())];
        let out = filter_detections(raw, &FilterConfig::default());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].label, "cat");
        assert_eq!(out[1].label, "mosquito");
    }

    #[test]
    fn iou_equal_to_threshold_is_not_suppressed() {
        // IoU exactly 0.5: 50 / 100
        let half = BoundingBox::new(0.0, 0.0, 10.0, 5.0);
        let raw = vec![det("cat", 0.9, box_a()), det("cat", 0.8, half)];
        assert_eq!(non_max_suppression(raw, 0.5).len(), 2);
    }

    #[test]
    fn ties_prefer_earlier_index() {
        let raw = vec![det("cat", 0.8, box_b()), det("cat", 0.8, box_a())];
        let out = non_max_suppression(raw, 0.5);
        assert_eq!(out, vec![det("cat", 0.8, box_b())]);
    }

    #[test]
    fn suppressed_detection_does_not_suppress_others() {
        // a suppresses b; b would have suppressed c, but c only overlaps b.
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(2.0, 0.0, 12.0, 10.0);
        let c = BoundingBox::new(6.0, 0.0, 16.0, 10.0);
        assert!(a.iou(&b) > 0.5 && b.iou(&c) > 0.5 && a.iou(&c) < 0.5);
        let raw = vec![det("cat", 0.9, a), det("cat", 0.8, b), det("cat", 0.7, c)];
        let out = non_max_suppression(raw, 0.5);
        let confidences: Vec<f32> = out.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn allowlist_and_cap_apply() {
        let cfg = FilterConfig {
            max_detections: Some(2),
            classes: vec!["mosquito".to_string()],
            ..FilterConfig::default()
        };
        let far = |i: f32| BoundingBox::new(i * 100.0, 0.0, i * 100.0 + 10.0, 10.0);
        let raw = vec![
            det("cat", 0.99, far(0.0)),
            det("mosquito", 0.5, far(1.0)),
            det("mosquito", 0.7, far(2.0)),
            det("mosquito", 0.6, far(3.0)),
        ];
        let out = filter_detections(raw, &cfg);
        let confidences: Vec<f32> = out.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.7, 0.6]);
    }

    #[test]
    fn out_of_range_scores_are_dropped() {
        let raw = vec![
            det("cat", f32::NAN, box_a()),
            det("cat", 1.5, box_a()),
            det("cat", 0.4, box_a()),
        ];
        let out = filter_detections(raw, &FilterConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.4);
    }
}
