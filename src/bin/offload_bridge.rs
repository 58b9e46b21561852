//! offload_bridge - device-side endpoint of the `SET`/`JPG` command protocol.
//!
//! An evaluation driver connects, configures the session with `SET` and streams JPEGs
//! with `JPG <n>`. Each payload is posted to the edge_server and the result is written
//! back as one JSON line.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::{mpsc, Arc};

use edge_offload::{CommandBridge, EdgeConfig, HttpTransport, Rotation};

#[derive(Parser, Debug)]
#[command(author, version, about = "Command protocol bridge in front of an edge_server")]
struct Args {
    /// Listen address (overrides bridge.addr).
    #[arg(long)]
    addr: Option<String>,

    /// Server base URL (overrides client.server_url).
    #[arg(long)]
    server_url: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = EdgeConfig::load()?;
    let mut bridge_cfg = cfg.bridge_config();
    if let Some(addr) = args.addr {
        bridge_cfg.addr = addr;
    }
    let server_url = args
        .server_url
        .unwrap_or_else(|| cfg.client.server_url.clone());
    let transport = Arc::new(HttpTransport::new(&server_url, Rotation::None)?);
    log::info!("forwarding JPG payloads to {}", transport.endpoint());

    let handle = CommandBridge::new(bridge_cfg, transport).spawn()?;
    log::info!("offload_bridge running on {}", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping command bridge...");
    handle.stop()?;
    Ok(())
}
