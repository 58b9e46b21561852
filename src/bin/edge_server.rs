//! edge_server - detection server for offloaded frames.
//!
//! Listens for `POST /api/edge_app2`, runs the detection cascade on each frame and
//! answers with boxes and timings. One request per client address is processed at a
//! time; overlapping requests from the same address get an empty response.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::mpsc;

use edge_offload::{Cascade, EdgeConfig, EdgeServer, StubClassifier, StubDetector};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detection server for edge offload clients")]
struct Args {
    /// Listen address (overrides server.addr).
    #[arg(long)]
    addr: Option<String>,

    /// Skip the stage-2 classifier on the top candidate.
    #[arg(long)]
    no_refine: bool,

    /// Largest accepted request body in bytes (overrides server.max_body_bytes).
    #[arg(long)]
    max_body_bytes: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = EdgeConfig::load()?;
    let mut server_cfg = cfg.server_config();
    if let Some(addr) = args.addr {
        server_cfg.addr = addr;
    }
    if let Some(max_body_bytes) = args.max_body_bytes {
        server_cfg.max_body_bytes = max_body_bytes;
    }

    let mut cascade = Cascade::new(StubDetector::new());
    if cfg.server.refine_top_candidate && !args.no_refine {
        cascade = cascade.with_classifier(StubClassifier::new());
    }

    let handle = EdgeServer::new(server_cfg, cascade).spawn()?;
    log::info!("edge_server running on {}", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("edge_server waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping edge server...");
    handle.stop()?;
    Ok(())
}
