//! Single-slot mailbox holding the latest completed detection.
//!
//! Writers (offload threads) publish whole snapshots; the capture loop reads a shared
//! handle to whichever snapshot was published last. A publish is a pointer swap, so a
//! reader sees either the previous snapshot or the new one, never a mix. No history
//! is kept and no ordering between offloads is enforced: the last write wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::detect::DetectionResult;

/// Immutable view of one completed offload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverlaySnapshot {
    pub result: DetectionResult,
    /// Round-trip rate in offloads per second, rounded to 2 decimals.
    pub frame_rate: f64,
    /// Capture index of the frame that produced `result`.
    pub frame_index: Option<u64>,
}

impl OverlaySnapshot {
    pub fn new(result: DetectionResult, frame_rate: f64, frame_index: u64) -> Self {
        Self {
            result,
            frame_rate,
            frame_index: Some(frame_index),
        }
    }
}

/// Shared overlay slot. Cloning shares the slot.
#[derive(Clone, Debug, Default)]
pub struct Overlay {
    slot: Arc<Mutex<Arc<OverlaySnapshot>>>,
    updates: Arc<AtomicU64>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest snapshot; the empty default until the first publish.
    pub fn snapshot(&self) -> Arc<OverlaySnapshot> {
        match self.slot.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the slot contents.
    pub fn publish(&self, snapshot: OverlaySnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.slot.lock() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of publishes so far.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }
}

/// `round(1 / t, 2)` for an elapsed round trip `t`. Zero elapsed time yields 0.
pub fn round_trip_rate(elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    ((1.0 / secs) * 100.0).round() / 100.0
}
