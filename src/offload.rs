//! Capture-side offload dispatcher.
//!
//! Every `offload_interval`-th frame is copied and handed to a detached worker thread
//! that encodes it, posts it to the detection server and, when a non-empty response
//! comes back, publishes the decoded result into the shared [`Overlay`]. The capture
//! loop never waits for a worker. There is no client-side single-flight: a new worker
//! is spawned on every eligible frame even if earlier ones are still outstanding, and
//! whichever finishes last owns the overlay.
//!
//! Failures (connect errors, timeouts, empty or malformed bodies) are logged and
//! dropped. Nothing is retried.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use url::Url;

use crate::detect::DetectionResult;
use crate::frame::{Frame, Rotation};
use crate::overlay::{round_trip_rate, Overlay, OverlaySnapshot};
use crate::transport::http::{decode_response, EDGE_APP_PATH, IMAGE_CONTENT_TYPE};
use crate::transport::ClientTimings;

/// Sends one encoded frame and returns the raw response body.
pub trait OffloadTransport: Send + Sync {
    fn round_trip(&self, jpeg: &[u8]) -> Result<Vec<u8>>;
}

/// `POST /api/edge_app2` over HTTP.
pub struct HttpTransport {
    endpoint: Url,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(server_url: &str, rotation: Rotation) -> Result<Self> {
        let base = Url::parse(server_url)
            .with_context(|| format!("invalid server url '{}'", server_url))?;
        let mut endpoint = base
            .join(EDGE_APP_PATH)
            .with_context(|| format!("join {} onto {}", EDGE_APP_PATH, server_url))?;
        if rotation != Rotation::None {
            endpoint
                .query_pairs_mut()
                .append_pair("r", &rotation.degrees().to_string());
        }
        Ok(Self {
            endpoint,
            agent: ureq::AgentBuilder::new().build(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl OffloadTransport for HttpTransport {
    fn round_trip(&self, jpeg: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", IMAGE_CONTENT_TYPE)
            .send_bytes(jpeg)
            .with_context(|| format!("post frame to {}", self.endpoint))?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .context("read detection response")?;
        Ok(body)
    }
}

pub struct Dispatcher {
    offload_interval: u64,
    jpeg_quality: u8,
    transport: Arc<dyn OffloadTransport>,
    overlay: Overlay,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn OffloadTransport>,
        overlay: Overlay,
        offload_interval: u64,
        jpeg_quality: u8,
    ) -> Result<Self> {
        if offload_interval == 0 {
            return Err(anyhow!("offload interval must be at least 1"));
        }
        Ok(Self {
            offload_interval,
            jpeg_quality,
            transport,
            overlay,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn should_offload(&self, frame_index: u64) -> bool {
        frame_index % self.offload_interval == 0
    }

    /// Offload `frame` when `frame_index` is on the interval. Returns whether a worker
    /// was started; never waits for it.
    pub fn maybe_offload(&self, frame: &Frame, frame_index: u64) -> bool {
        if !self.should_offload(frame_index) {
            return false;
        }

        let frame = frame.clone();
        let transport = Arc::clone(&self.transport);
        let overlay = self.overlay.clone();
        let quality = self.jpeg_quality;
        let in_flight = InFlight::enter(&self.in_flight);

        let spawned = thread::Builder::new()
            .name(format!("offload-{}", frame_index))
            .spawn(move || {
                let _in_flight = in_flight;
                match offload_once(transport.as_ref(), &frame, quality, frame_index) {
                    Ok(Some(snapshot)) => {
                        log::debug!(
                            "offload {}: {} boxes at {:.2} fps",
                            frame_index,
                            snapshot.result.boxes.len(),
                            snapshot.frame_rate
                        );
                        overlay.publish(snapshot);
                    }
                    Ok(None) => {
                        log::debug!("offload {}: empty response, overlay unchanged", frame_index)
                    }
                    Err(err) => log::warn!("offload {} dropped: {:#}", frame_index, err),
                }
            });
        match spawned {
            Ok(_) => true,
            Err(err) => {
                log::warn!("offload {}: could not start worker: {}", frame_index, err);
                false
            }
        }
    }

    /// Workers started and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// One offload: encode, round trip, decode. `Ok(None)` for an empty body.
fn offload_once(
    transport: &dyn OffloadTransport,
    frame: &Frame,
    quality: u8,
    frame_index: u64,
) -> Result<Option<OverlaySnapshot>> {
    let started = Instant::now();
    let jpeg = frame.to_jpeg(quality)?;
    let encode = started.elapsed();

    let sent = Instant::now();
    let body = transport.round_trip(&jpeg)?;
    let round_trip = sent.elapsed();

    let Some(response) = decode_response(&body)? else {
        return Ok(None);
    };
    let client = ClientTimings::measured(
        encode,
        round_trip,
        started.elapsed(),
        Some(&response.server_timings),
    );
    let result = DetectionResult::new(response.boxes(), client.combine(&response.server_timings));
    Ok(Some(OverlaySnapshot::new(
        result,
        round_trip_rate(round_trip),
        frame_index,
    )))
}

/// Counts a worker as in flight until dropped, including on panic.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionBox;
    use crate::transport::http::{EdgeResponse, ServerTimings};
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    const RED: [u8; 3] = [250, 10, 10];
    const BLUE: [u8; 3] = [10, 10, 250];

    fn body_with(label: &str) -> Vec<u8> {
        let boxes = vec![DetectionBox::new(label, 0.7, 10, 10, 30, 30)];
        EdgeResponse::from_boxes(&boxes, ServerTimings::default())
            .to_json()
            .unwrap()
    }

    fn is_red(jpeg: &[u8]) -> bool {
        let frame = Frame::decode(jpeg).unwrap();
        frame.pixel(0, 0).unwrap()[0] > 128
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Red frames wait for the gate, blue frames answer immediately.
    struct GatedTransport {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl OffloadTransport for GatedTransport {
        fn round_trip(&self, jpeg: &[u8]) -> Result<Vec<u8>> {
            if is_red(jpeg) {
                self.gate
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(10))?;
                Ok(body_with("slow"))
            } else {
                Ok(body_with("fast"))
            }
        }
    }

    struct FixedTransport {
        calls: AtomicUsize,
        reply: fn() -> Result<Vec<u8>>,
    }

    impl FixedTransport {
        fn new(reply: fn() -> Result<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply,
            })
        }
    }

    impl OffloadTransport for FixedTransport {
        fn round_trip(&self, _jpeg: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)()
        }
    }

    #[test]
    fn later_offload_can_overtake_and_last_completion_wins() {
        let (release, gate) = mpsc::channel();
        let transport = Arc::new(GatedTransport {
            gate: Mutex::new(gate),
        });
        let dispatcher = Dispatcher::new(transport, Overlay::new(), 1, 80).unwrap();

        assert!(dispatcher.maybe_offload(&Frame::filled(32, 32, RED), 0));
        assert!(dispatcher.maybe_offload(&Frame::filled(32, 32, BLUE), 1));

        let overlay = dispatcher.overlay().clone();
        wait_until(|| overlay.updates() == 1);
        let snapshot = overlay.snapshot();
        assert_eq!(snapshot.result.boxes[0].label, "fast");
        assert_eq!(snapshot.frame_index, Some(1));
        wait_until(|| dispatcher.in_flight() == 1);

        release.send(()).unwrap();
        wait_until(|| overlay.updates() == 2);
        let snapshot = overlay.snapshot();
        assert_eq!(snapshot.result.boxes[0].label, "slow");
        assert_eq!(snapshot.frame_index, Some(0));
        assert!(snapshot.frame_rate > 0.0);
        wait_until(|| dispatcher.in_flight() == 0);
    }

    #[test]
    fn only_frames_on_the_interval_are_offloaded() {
        let transport = FixedTransport::new(|| Ok(body_with("dog")));
        let dispatcher = Dispatcher::new(transport.clone(), Overlay::new(), 3, 80).unwrap();
        let frame = Frame::filled(16, 16, BLUE);

        let started: Vec<u64> = (0..7)
            .filter(|index| dispatcher.maybe_offload(&frame, *index))
            .collect();
        assert_eq!(started, vec![0, 3, 6]);

        wait_until(|| dispatcher.in_flight() == 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.overlay().updates(), 3);
    }

    #[test]
    fn failures_leave_overlay_untouched() {
        let replies: [fn() -> Result<Vec<u8>>; 3] = [
            || Err(anyhow!("connection refused")),
            || Ok(Vec::new()),
            || Ok(b"{not json".to_vec()),
        ];
        for reply in replies {
            let transport = FixedTransport::new(reply);
            let dispatcher = Dispatcher::new(transport.clone(), Overlay::new(), 1, 80).unwrap();
            assert!(dispatcher.maybe_offload(&Frame::filled(16, 16, RED), 0));
            wait_until(|| dispatcher.in_flight() == 0);
            assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
            assert_eq!(dispatcher.overlay().updates(), 0);
            assert!(dispatcher.overlay().snapshot().result.is_empty());
        }
    }

    #[test]
    fn empty_result_still_updates_rate() {
        let transport = FixedTransport::new(|| {
            thread::sleep(Duration::from_millis(20));
            Ok(EdgeResponse::default().to_json().unwrap())
        });
        let dispatcher = Dispatcher::new(transport, Overlay::new(), 1, 80).unwrap();
        dispatcher.maybe_offload(&Frame::filled(16, 16, RED), 0);
        wait_until(|| dispatcher.overlay().updates() == 1);
        let snapshot = dispatcher.overlay().snapshot();
        assert!(snapshot.result.is_empty());
        assert!(snapshot.frame_rate > 0.0);
        assert!(snapshot.frame_rate <= 50.0);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let transport = FixedTransport::new(|| Ok(Vec::new()));
        assert!(Dispatcher::new(transport, Overlay::new(), 0, 80).is_err());
    }

    #[test]
    fn http_endpoint_carries_rotation() {
        let plain = HttpTransport::new("http://10.0.0.5:8000", Rotation::None).unwrap();
        assert_eq!(plain.endpoint().as_str(), "http://10.0.0.5:8000/api/edge_app2");
        let rotated = HttpTransport::new("http://10.0.0.5:8000/", Rotation::Cw270).unwrap();
        assert_eq!(
            rotated.endpoint().as_str(),
            "http://10.0.0.5:8000/api/edge_app2?r=270"
        );
        assert!(HttpTransport::new("not a url", Rotation::None).is_err());
    }
}
