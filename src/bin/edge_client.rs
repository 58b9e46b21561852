//! edge_client - capture loop that offloads detection to an edge_server.
//!
//! Frames come from a directory of images or a synthetic generator. Every Nth frame
//! is posted to the server in the background; each frame is drawn with the latest
//! detection overlay and logged.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edge_offload::{
    CaptureConfig, CaptureLoop, Dispatcher, EdgeConfig, FrameSource, HttpTransport,
    ImageDirSource, LogSink, Overlay, Rotation, SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture loop with offloaded detection")]
struct Args {
    /// Server base URL (overrides client.server_url).
    #[arg(long)]
    server_url: Option<String>,

    /// Replay images from this directory instead of generating frames.
    #[arg(long, env = "EDGE_IMAGE_DIR")]
    image_dir: Option<PathBuf>,

    /// Offload every Nth frame (overrides client.offload_interval).
    #[arg(long)]
    interval: Option<u64>,

    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Clockwise rotation the server applies before detection.
    #[arg(long, allow_hyphen_values = true)]
    rotation: Option<i32>,

    /// Synthetic frame width.
    #[arg(long, default_value = "640")]
    width: u32,

    /// Synthetic frame height.
    #[arg(long, default_value = "480")]
    height: u32,

    /// Log the overlay of every Nth frame.
    #[arg(long, default_value = "30")]
    log_every: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = EdgeConfig::load()?;
    let server_url = args
        .server_url
        .unwrap_or_else(|| cfg.client.server_url.clone());
    let interval = args.interval.unwrap_or(cfg.client.offload_interval);
    let rotation = match args.rotation {
        Some(degrees) => Rotation::from_degrees(degrees)?,
        None => cfg.client.rotation,
    };

    let transport = Arc::new(HttpTransport::new(&server_url, rotation)?);
    log::info!("offloading every {} frame(s) to {}", interval, transport.endpoint());
    let dispatcher = Dispatcher::new(transport, Overlay::new(), interval, cfg.jpeg_quality())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let capture_cfg = CaptureConfig {
        frame_delay: cfg.client.frame_delay,
        max_frames: args.frames,
    };
    let sink = LogSink::new(args.log_every);
    let stats = match &args.image_dir {
        Some(dir) => run(ImageDirSource::open(dir)?, sink, dispatcher, capture_cfg, &shutdown)?,
        None => run(
            SyntheticSource::new(args.width, args.height),
            sink,
            dispatcher,
            capture_cfg,
            &shutdown,
        )?,
    };
    log::info!(
        "edge_client stopped after {} frames, {} offloads",
        stats.frames,
        stats.offloads
    );
    Ok(())
}

fn run<S: FrameSource>(
    source: S,
    sink: LogSink,
    dispatcher: Dispatcher,
    capture_cfg: CaptureConfig,
    shutdown: &AtomicBool,
) -> Result<edge_offload::CaptureStats> {
    let mut capture = CaptureLoop::new(source, sink, dispatcher, capture_cfg);
    let stats = capture.run(shutdown)?;

    // Give outstanding offloads a moment to land before exiting.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while capture.dispatcher().in_flight() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    let snapshot = capture.dispatcher().overlay().snapshot();
    log::info!(
        "last overlay: {} boxes at {:.2} fps",
        snapshot.result.boxes.len(),
        snapshot.frame_rate
    );
    Ok(stats)
}
