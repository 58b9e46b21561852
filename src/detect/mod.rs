mod backend;
mod backends;
mod cascade;
pub mod remap;
mod result;

pub use backend::{Classification, Classifier, Detector};
pub use backends::{StubClassifier, StubDetector};
pub use cascade::Cascade;
pub use remap::{canonical_label, Category, ImageIndex, ReferenceDetection, Taxonomy};
pub use result::{DetectionBox, DetectionResult, Timings};
