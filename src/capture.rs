//! Capture loop.
//!
//! Pulls frames from a [`FrameSource`], offers every frame to the [`Dispatcher`] (which
//! offloads on its own interval), draws the latest overlay snapshot onto the frame and
//! hands it to a [`FrameSink`]. The loop is single-threaded and never waits on an
//! offload; offload workers only ever touch the overlay slot.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::offload::Dispatcher;
use crate::render::{OverlayRenderer, OverlayText};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub trait FrameSource {
    fn describe(&self) -> String;

    /// Next frame, or `None` when the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Synthetic source
// ----------------------------------------------------------------------------

/// Generated moving pattern, for runs without a camera.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: 0,
            scene_state: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.frame_count += 1;
        // Scene changes every 50 frames.
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let shade = self.scene_state.wrapping_mul(40);
        let mut frame = Frame::filled(self.width, self.height, [shade, 64, 128]);

        // A block a quarter of the frame wide sweeps left to right.
        let block_w = (self.width / 4).max(1) as i64;
        let block_h = (self.height / 4).max(1) as i64;
        let span = (self.width as i64 - block_w).max(1);
        let x0 = (self.frame_count as i64 * 4) % span;
        let y0 = (self.height as i64 - block_h) / 2;
        for y in y0..y0 + block_h {
            for x in x0..x0 + block_w {
                frame.put_pixel(x, y, [240, 240, 240]);
            }
        }
        Ok(Some(frame))
    }
}

// ----------------------------------------------------------------------------
// Image directory source
// ----------------------------------------------------------------------------

/// Replays the JPEG/PNG files of a directory in file-name order.
pub struct ImageDirSource {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let paths = list_images(dir)?;
        if paths.is_empty() {
            return Err(anyhow!("no images in {}", dir.display()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            paths,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn describe(&self) -> String {
        format!("{} ({} images)", self.dir.display(), self.paths.len())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let frame = Frame::decode(&bytes).with_context(|| format!("decode {}", path.display()))?;
        Ok(Some(frame))
    }
}

/// `.jpg`, `.jpeg` and `.png` files directly under `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false);
        if is_image && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

// ----------------------------------------------------------------------------
// Sinks
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkControl {
    Continue,
    Stop,
}

/// Where rendered frames go (a display, an encoder, a log).
pub trait FrameSink {
    fn present(&mut self, frame: &Frame, texts: &[OverlayText], frame_index: u64)
        -> Result<SinkControl>;
}

/// Logs the overlay text of every `every`-th frame.
pub struct LogSink {
    every: u64,
}

impl LogSink {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl FrameSink for LogSink {
    fn present(
        &mut self,
        frame: &Frame,
        texts: &[OverlayText],
        frame_index: u64,
    ) -> Result<SinkControl> {
        if frame_index % self.every == 0 {
            let overlay: Vec<&str> = texts.iter().map(|t| t.text.as_str()).collect();
            log::info!(
                "frame {} {}x{}: {}",
                frame_index,
                frame.width(),
                frame.height(),
                overlay.join(", ")
            );
        }
        Ok(SinkControl::Continue)
    }
}

// ----------------------------------------------------------------------------
// Loop
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct CaptureConfig {
    /// Pause after each presented frame.
    pub frame_delay: Duration,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub offloads: u64,
}

pub struct CaptureLoop<S, K> {
    source: S,
    sink: K,
    dispatcher: Dispatcher,
    renderer: OverlayRenderer,
    config: CaptureConfig,
}

impl<S: FrameSource, K: FrameSink> CaptureLoop<S, K> {
    pub fn new(source: S, sink: K, dispatcher: Dispatcher, config: CaptureConfig) -> Self {
        Self {
            source,
            sink,
            dispatcher,
            renderer: OverlayRenderer::new(),
            config,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Run until the source ends, the sink stops, `max_frames` is reached or
    /// `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<CaptureStats> {
        let mut stats = CaptureStats::default();
        let mut last_health_log = Instant::now();
        log::info!("capture loop reading from {}", self.source.describe());

        while !shutdown.load(Ordering::SeqCst) {
            if let Some(max) = self.config.max_frames {
                if stats.frames >= max {
                    break;
                }
            }
            let Some(mut frame) = self.source.next_frame()? else {
                log::info!("capture source exhausted");
                break;
            };
            let frame_index = stats.frames;
            if self.dispatcher.maybe_offload(&frame, frame_index) {
                stats.offloads += 1;
            }

            let snapshot = self.dispatcher.overlay().snapshot();
            let texts = self.renderer.render(&mut frame, &snapshot);
            stats.frames += 1;
            if self.sink.present(&frame, &texts, frame_index)? == SinkControl::Stop {
                break;
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                log::info!(
                    "capture health={} frames={} offloads={} in_flight={} boxes={} fps={:.2}",
                    self.source.is_healthy(),
                    stats.frames,
                    stats.offloads,
                    self.dispatcher.in_flight(),
                    snapshot.result.boxes.len(),
                    snapshot.frame_rate
                );
                last_health_log = Instant::now();
            }
            if !self.config.frame_delay.is_zero() {
                std::thread::sleep(self.config.frame_delay);
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionBox;
    use crate::offload::OffloadTransport;
    use crate::overlay::Overlay;
    use crate::transport::http::{EdgeResponse, ServerTimings};
    use std::sync::Arc;

    struct EchoTransport;

    impl OffloadTransport for EchoTransport {
        fn round_trip(&self, _jpeg: &[u8]) -> Result<Vec<u8>> {
            let boxes = vec![DetectionBox::new("person", 0.9, 2, 2, 10, 10)];
            EdgeResponse::from_boxes(&boxes, ServerTimings::default()).to_json()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<(u64, Vec<String>)>,
        stop_after: Option<usize>,
    }

    impl FrameSink for RecordingSink {
        fn present(
            &mut self,
            _frame: &Frame,
            texts: &[OverlayText],
            frame_index: u64,
        ) -> Result<SinkControl> {
            self.frames
                .push((frame_index, texts.iter().map(|t| t.text.clone()).collect()));
            match self.stop_after {
                Some(n) if self.frames.len() >= n => Ok(SinkControl::Stop),
                _ => Ok(SinkControl::Continue),
            }
        }
    }

    fn dispatcher(interval: u64) -> Dispatcher {
        Dispatcher::new(Arc::new(EchoTransport), Overlay::new(), interval, 80).unwrap()
    }

    #[test]
    fn offloads_on_interval_and_renders_every_frame() {
        let config = CaptureConfig {
            max_frames: Some(5),
            ..CaptureConfig::default()
        };
        let mut capture = CaptureLoop::new(
            SyntheticSource::new(32, 24),
            RecordingSink::default(),
            dispatcher(2),
            config,
        );
        let stats = capture.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(stats, CaptureStats { frames: 5, offloads: 3 });

        let presented = &capture.sink().frames;
        assert_eq!(presented.len(), 5);
        assert_eq!(presented[0].0, 0);
        // Every frame carries at least the rate readout.
        assert!(presented.iter().all(|(_, texts)| texts.last().unwrap().ends_with("fps")));
    }

    #[test]
    fn sink_can_stop_the_loop() {
        let sink = RecordingSink {
            stop_after: Some(2),
            ..RecordingSink::default()
        };
        let mut capture = CaptureLoop::new(
            SyntheticSource::new(16, 16),
            sink,
            dispatcher(1),
            CaptureConfig::default(),
        );
        let stats = capture.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(stats.frames, 2);
    }

    #[test]
    fn shutdown_flag_stops_before_first_frame() {
        let mut capture = CaptureLoop::new(
            SyntheticSource::new(16, 16),
            RecordingSink::default(),
            dispatcher(1),
            CaptureConfig::default(),
        );
        let stats = capture.run(&AtomicBool::new(true)).unwrap();
        assert_eq!(stats, CaptureStats::default());
        assert!(capture.sink().frames.is_empty());
    }

    #[test]
    fn image_dir_replays_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let red = Frame::filled(8, 8, [200, 0, 0]).to_jpeg(90).unwrap();
        let blue = Frame::filled(4, 4, [0, 0, 200]).to_jpeg(90).unwrap();
        std::fs::write(dir.path().join("b.jpg"), &red).unwrap();
        std::fs::write(dir.path().join("a.JPEG"), &blue).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.next_frame().unwrap().unwrap().width(), 4);
        assert_eq!(source.next_frame().unwrap().unwrap().width(), 8);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn empty_image_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageDirSource::open(dir.path()).is_err());
    }
}
