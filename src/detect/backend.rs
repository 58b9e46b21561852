use anyhow::Result;

use crate::detect::result::DetectionBox;
use crate::frame::Frame;

/// Whole-frame object detector (cascade stage 1).
///
/// The neural network behind this trait is a black box: it maps an image to zero or
/// more labelled boxes, ordered by the detector's own priority. The cascade relies on
/// that order and never re-sorts by confidence.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Best label for an image crop.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// Crop classifier (cascade stage 2).
pub trait Classifier: Send {
    fn name(&self) -> &'static str;

    /// Classify a crop. `None` means the classifier produced no label.
    fn classify(&mut self, crop: &Frame) -> Result<Option<Classification>>;
}
