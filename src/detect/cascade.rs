use anyhow::Result;

use crate::detect::backend::{Classifier, Detector};
use crate::detect::result::DetectionBox;
use crate::frame::Frame;

/// Two-stage detection cascade.
///
/// Stage 1 runs the detector over the whole frame. When stage 2 is enabled and stage 1
/// found anything, the FIRST stage-1 box (detector order, not highest confidence) is
/// cropped out of the frame and handed to the classifier, whose best label and
/// confidence replace that box's label and confidence. Coordinates and every other
/// box are left exactly as stage 1 produced them.
pub struct Cascade {
    detector: Box<dyn Detector>,
    classifier: Option<Box<dyn Classifier>>,
}

impl Cascade {
    /// Stage-1 only cascade.
    pub fn new<D: Detector + 'static>(detector: D) -> Self {
        Self {
            detector: Box::new(detector),
            classifier: None,
        }
    }

    /// Enable stage 2 with `classifier`.
    pub fn with_classifier<C: Classifier + 'static>(mut self, classifier: C) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    /// Drop stage 2, if configured.
    pub fn without_refinement(mut self) -> Self {
        self.classifier = None;
        self
    }

    pub fn refines_top_candidate(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.detector.warm_up()
    }

    pub fn run(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>> {
        let mut boxes = self.detector.detect(frame)?;

        let Some(classifier) = self.classifier.as_mut() else {
            return Ok(boxes);
        };
        let Some(top) = boxes.first_mut() else {
            return Ok(boxes);
        };

        let Some(crop) = frame.crop(top.left, top.top, top.right, top.bottom) else {
            log::debug!(
                "cascade: top candidate '{}' lies outside the frame, skipping refinement",
                top.label
            );
            return Ok(boxes);
        };

        if let Some(best) = classifier.classify(&crop)? {
            log::debug!(
                "cascade: refined '{}' ({:.2}) -> '{}' ({:.2})",
                top.label,
                top.confidence,
                best.label,
                best.confidence
            );
            top.relabel(best.label, best.confidence);
        }
        Ok(boxes)
    }
}
