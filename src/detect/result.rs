use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::GestureLabel;

/// Axis-aligned bounding box in the detector's pixel (or normalized) space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
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

    pub fn centroid(&self) -> (f32, f32) {
        (
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    /// Intersection-over-union in 0..=1. Degenerate boxes yield 0.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x_max.min(other.x_max) - self.x_min.max(other.x_min)).max(0.0);
        let iy = (self.y_max.min(other.y_max) - self.y_min.max(other.y_min)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    pub fn centroid_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.centroid();
        let (bx, by) = other.centroid();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    fn is_well_formed(&self) -> bool {
        let coords = [self.x_min, self.y_min, self.x_max, self.y_max];
        coords.iter().all(|c| c.is_finite()) && self.x_min < self.x_max && self.y_min < self.y_max
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        BoundingBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x_min, b.y_min, b.x_max, b.y_max]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: Option<f32>,
}

/// One hand as reported by the external classifier for one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
    #[serde(rename = "gesture", deserialize_with = "deserialize_label")]
    pub label: GestureLabel,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(
        bbox: BoundingBox,
        landmarks: Vec<Landmark>,
        label: GestureLabel,
        confidence: f32,
    ) -> Self {
        Self {
            bbox,
            landmarks,
            label,
            confidence,
        }
    }

    /// Reject detections the tracker must never see.
    ///
    /// Malformed input is a data-quality problem, not an error of the
    /// pipeline: callers drop the detection and keep going.
    pub fn validate(&self) -> Result<()> {
        if self.landmarks.is_empty() {
            return Err(anyhow!("detection has no landmarks"));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!(
                "detection confidence {} outside 0..=1",
                self.confidence
            ));
        }
        if !self.bbox.is_well_formed() {
            return Err(anyhow!("detection bounding box {:?} malformed", self.bbox));
        }
        if self
            .landmarks
            .iter()
            .any(|lm| !lm.x.is_finite() || !lm.y.is_finite())
        {
            return Err(anyhow!("detection has non-finite landmark coordinates"));
        }
        Ok(())
    }
}

/// All detections for one processed frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp_ms: u64,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

fn deserialize_label<'de, D>(deserializer: D) -> std::result::Result<GestureLabel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(GestureLabel::from_classifier(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hand(label: GestureLabel, confidence: f32) -> RawDetection {
        RawDetection::new(
            BoundingBox::new(10.0, 10.0, 50.0, 60.0),
            vec![Landmark {
                x: 20.0,
                y: 30.0,
                z: None,
            }],
            label,
            confidence,
        )
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_shifted_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn validate_rejects_missing_landmarks() {
        let mut det = hand(GestureLabel::Peace, 0.9);
        det.landmarks.clear();
        assert!(det.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_confidence() {
        assert!(hand(GestureLabel::Peace, 1.2).validate().is_err());
        assert!(hand(GestureLabel::Peace, -0.1).validate().is_err());
        assert!(hand(GestureLabel::Peace, f32::NAN).validate().is_err());
        assert!(hand(GestureLabel::Peace, 1.0).validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_box() {
        let mut det = hand(GestureLabel::Fist, 0.8);
        det.bbox = BoundingBox::new(50.0, 10.0, 10.0, 60.0);
        assert!(det.validate().is_err());
    }

    #[test]
    fn frame_parses_classifier_json() {
        let json = r#"{
            "timestamp_ms": 1700000000123,
            "detections": [
                {
                    "bbox": [10, 20, 110, 140],
                    "landmarks": [{"x": 15, "y": 25}, {"x": 40, "y": 60, "z": 0.1}],
                    "gesture": "Thumbs_Up",
                    "confidence": 0.93
                },
                {
                    "bbox": [300, 20, 380, 140],
                    "landmarks": [{"x": 310, "y": 30}],
                    "gesture": "No Hand",
                    "confidence": 0.27
                }
            ]
        }"#;
        let frame: Frame = serde_json::from_str(json).expect("frame json");
        assert_eq!(frame.timestamp_ms, 1_700_000_000_123);
        assert_eq!(frame.detections.len(), 2);
        assert_eq!(frame.detections[0].label, GestureLabel::ThumbsUp);
        assert_eq!(frame.detections[0].bbox.x_max, 110.0);
        assert_eq!(frame.detections[1].label, GestureLabel::Unknown);
    }
}
