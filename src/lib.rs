//! Edge offload pipeline.
//!
//! A capture device hands every Nth frame to a fire-and-forget dispatcher that posts
//! it to a remote detection server, while the capture loop keeps rendering whatever
//! detection result arrived last.
//!
//! # Module Structure
//!
//! - `frame`: decoded RGB frames, JPEG encode/decode, crop and rotation
//! - `detect`: detector/classifier traits, the two-stage cascade, category remap
//! - `transport`: HTTP codec and the persistent `SET`/`JPG` command protocol
//! - `admission`: per-client single-flight gate used by the server
//! - `server`: `POST /api/edge_app2` detection server
//! - `offload`, `overlay`: capture-side dispatcher and its single-slot result mailbox
//! - `render`, `capture`: overlay drawing and the capture loop
//! - `session`: device-side command bridge serving the command protocol
//! - `config`: file + environment configuration

pub mod admission;
pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod offload;
pub mod overlay;
pub mod render;
pub mod server;
pub mod session;
pub mod transport;

pub use admission::{AdmissionController, AdmissionGuard};
pub use capture::{
    CaptureConfig, CaptureLoop, CaptureStats, FrameSink, FrameSource, ImageDirSource, LogSink,
    SinkControl, SyntheticSource,
};
pub use config::EdgeConfig;
pub use detect::{
    Cascade, Classification, Classifier, DetectionBox, DetectionResult, Detector, StubClassifier,
    StubDetector, Taxonomy, Timings,
};
pub use frame::{Frame, Rotation};
pub use offload::{Dispatcher, HttpTransport, OffloadTransport};
pub use overlay::{round_trip_rate, Overlay, OverlaySnapshot};
pub use render::{OverlayRenderer, OverlayText};
pub use server::{EdgeServer, EdgeServerConfig, EdgeServerHandle};
pub use session::{BridgeConfig, BridgeHandle, CommandBridge, Session, SessionSettings};
pub use transport::command::{CommandClient, DetectionLine};
