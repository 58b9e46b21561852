use serde::{Deserialize, Serialize};

/// One labelled box in pixel coordinates of the frame it was detected on.
///
/// Coordinates may reach past the frame edges; consumers clamp them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub label: String,
    /// Always within `[0, 1]`.
    pub confidence: f32,
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DetectionBox {
    pub fn new(
        label: impl Into<String>,
        confidence: f32,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    ) -> Self {
        Self {
            label: label.into(),
            confidence: clamp_confidence(confidence),
            left,
            top,
            right,
            bottom,
        }
    }

    /// Build from a centre point and full width/height. Inverse of
    /// [`center`](Self::center) plus [`width`](Self::width)/[`height`](Self::height),
    /// odd sizes and negative coordinates included.
    pub fn from_center(
        label: impl Into<String>,
        confidence: f32,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
    ) -> Self {
        let left = x - w.div_euclid(2);
        let top = y - h.div_euclid(2);
        Self::new(label, confidence, left, top, left + w, top + h)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn center(&self) -> (i32, i32) {
        (
            (self.left + self.right).div_euclid(2),
            (self.top + self.bottom).div_euclid(2),
        )
    }

    /// Replace label and confidence, keeping the coordinates.
    pub fn relabel(&mut self, label: impl Into<String>, confidence: f32) {
        self.label = label.into();
        self.confidence = clamp_confidence(confidence);
    }

    /// Coordinates clamped into a `width` x `height` frame as `(x0, y0, x1, y1)`.
    pub fn clamped(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clamp = |v: i32, dim: u32| -> u32 {
            if dim == 0 || v <= 0 {
                0
            } else {
                (v as u32).min(dim - 1)
            }
        };
        (
            clamp(self.left, width),
            clamp(self.top, height),
            clamp(self.right, width),
            clamp(self.bottom, height),
        )
    }
}

/// Timing breakdown for one offload, in milliseconds (size in bytes).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub decode: f64,
    pub rotate: f64,
    pub encode: f64,
    pub detect: f64,
    pub network: f64,
    pub client_total: f64,
    pub server_total: f64,
    pub payload_size: usize,
}

/// Result of one completed offload. Immutable once built.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub boxes: Vec<DetectionBox>,
    pub timings: Timings,
}

impl DetectionResult {
    pub fn new(boxes: Vec<DetectionBox>, timings: Timings) -> Self {
        Self { boxes, timings }
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}
