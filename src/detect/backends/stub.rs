use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::{Classification, Classifier, Detector};
use crate::detect::result::DetectionBox;
use crate::frame::Frame;

/// Labels the stub detector draws from (detector-side names, before remapping).
const STUB_DETECTOR_LABELS: &[&str] = &[
    "person",
    "car",
    "dog",
    "tvmonitor",
    "sofa",
    "pottedplant",
    "bicycle",
    "motorbike",
];

const STUB_CLASSIFIER_LABELS: &[&str] = &[
    "tabby cat",
    "golden retriever",
    "sports car",
    "television",
    "studio couch",
    "mountain bike",
];

/// Stub detector for testing. Derives up to two boxes from a pixel digest, so the same
/// frame always yields the same detections.
#[derive(Default)]
pub struct StubDetector {
    frames_seen: u64,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>> {
        self.frames_seen += 1;
        let (width, height) = (frame.width() as i32, frame.height() as i32);
        if width < 4 || height < 4 {
            return Ok(vec![]);
        }

        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let count = (digest[0] % 3) as usize;

        let boxes = (0..count)
            .map(|i| {
                let seed = &digest[1 + i * 8..1 + (i + 1) * 8];
                let label = STUB_DETECTOR_LABELS[seed[0] as usize % STUB_DETECTOR_LABELS.len()];
                let confidence = 0.5 + seed[1] as f32 / 510.0;
                let w = (width / 4).max(2) + (seed[2] as i32 % (width / 4).max(1));
                let h = (height / 4).max(2) + (seed[3] as i32 % (height / 4).max(1));
                let x = seed[4] as i32 * width / 255;
                let y = seed[5] as i32 * height / 255;
                DetectionBox::from_center(label, confidence, x, y, w, h)
            })
            .collect();
        Ok(boxes)
    }
}

/// Stub crop classifier. Picks a label from a digest of the crop.
#[derive(Default)]
pub struct StubClassifier;

impl StubClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&mut self, crop: &Frame) -> Result<Option<Classification>> {
        if crop.pixels().is_empty() {
            return Ok(None);
        }
        let digest: [u8; 32] = Sha256::digest(crop.pixels()).into();
        let label = STUB_CLASSIFIER_LABELS[digest[0] as usize % STUB_CLASSIFIER_LABELS.len()];
        Ok(Some(Classification {
            label: label.to_string(),
            confidence: 0.6 + digest[1] as f32 / 640.0,
        }))
    }
}
