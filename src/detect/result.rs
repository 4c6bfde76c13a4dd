use crate::region::Point;

/// Axis-aligned box in frame pixel coordinates, `(x1, y1)` top-left.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// One detected box with optional class information.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Class id in label-map numbering (1-based). Motion boxes carry none.
    pub class_id: Option<u32>,
    pub label: Option<String>,
    pub score: Option<f32>,
}

impl Detection {
    /// Unlabelled box, as produced by motion detection.
    pub fn bare(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            class_id: None,
            label: None,
            score: None,
        }
    }

    pub fn classified(bbox: BoundingBox, class_id: u32, label: &str, score: f32) -> Self {
        Self {
            bbox,
            class_id: Some(class_id),
            label: Some(label.to_string()),
            score: Some(score),
        }
    }
}

/// Result of running a backend on one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Keep detections scoring at least `min_score` whose class is allowed.
    ///
    /// Detections without a score or class are kept only when the filter
    /// would not apply to them (motion boxes pass through).
    pub fn filtered(self, min_score: f32, allowed: &super::ClassAllowList) -> Self {
        let detections = self
            .detections
            .into_iter()
            .filter(|d| d.score.map_or(true, |s| s >= min_score))
            .filter(|d| d.class_id.map_or(true, |id| allowed.allows(id)))
            .collect();
        Self { detections }
    }
}
