//! offload_probe - drive an offload_bridge with a directory of JPEGs.
//!
//! Configures the session (`SET use_camera false`, `SET jpeg_quality`, `SET udp`),
//! sends every image with `JPG <n>` and collects the JSON result lines. Any reply
//! other than `ok` aborts the run with an error. With `--annotations`, results are
//! converted to reference-taxonomy detections and written to `--out`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};

use edge_offload::capture::list_images;
use edge_offload::detect::remap::{
    load_annotations, to_reference_detections, ImageIndex, ReferenceDetection,
};
use edge_offload::{CommandClient, DetectionLine, Taxonomy};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send JPEGs through an offload_bridge and collect results")]
struct Args {
    /// Bridge address.
    #[arg(long, env = "EDGE_BRIDGE_ADDR", default_value = "127.0.0.1:8080")]
    bridge: String,

    /// Directory of JPEG images, sent in file-name order.
    #[arg(long)]
    images: PathBuf,

    /// Send at most this many images.
    #[arg(long)]
    limit: Option<usize>,

    /// Quality the bridge re-encodes each payload at.
    #[arg(long, default_value = "95")]
    jpeg_quality: u32,

    /// Ask the bridge for its udp transport.
    #[arg(long)]
    udp: bool,

    /// Append every result line to this file.
    #[arg(long)]
    log: Option<PathBuf>,

    /// COCO-style annotation file providing categories and image ids.
    #[arg(long)]
    annotations: Option<PathBuf>,

    /// Where to write reference detections (with --annotations).
    #[arg(long, default_value = "detections.json")]
    out: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut paths = list_images(&args.images)?;
    if let Some(limit) = args.limit {
        paths.truncate(limit);
    }
    if paths.is_empty() {
        return Err(anyhow!("no images found in {}", args.images.display()));
    }

    let reference = match &args.annotations {
        Some(path) => Some(load_reference(path)?),
        None => None,
    };
    let mut log_file = match &args.log {
        Some(path) => Some(
            std::fs::File::create(path)
                .with_context(|| format!("create result log {}", path.display()))?,
        ),
        None => None,
    };

    let mut client = CommandClient::connect(args.bridge.as_str())?;
    client.set("use_camera", "false")?;
    client.set("jpeg_quality", &args.jpeg_quality.to_string())?;
    client.set("udp", if args.udp { "true" } else { "false" })?;

    let mut detections: Vec<ReferenceDetection> = Vec::new();
    let mut dropped = 0usize;
    for (index, path) in paths.iter().enumerate() {
        let jpeg = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let raw = client.process_jpg(&jpeg)?;
        if let Some(file) = log_file.as_mut() {
            writeln!(file, "{}", raw)?;
        }

        let line = match serde_json::from_str::<DetectionLine>(&raw) {
            Ok(line) if !line.is_dropped() => line,
            Ok(_) => {
                dropped += 1;
                continue;
            }
            Err(err) => {
                log::warn!("unparseable result for {}: {}", path.display(), err);
                dropped += 1;
                continue;
            }
        };

        if let Some((taxonomy, images)) = &reference {
            match image_id(images, path) {
                Some(image_id) => {
                    detections.extend(to_reference_detections(image_id, &line.boxes(), taxonomy))
                }
                None => log::warn!("{} is not in the annotation file", path.display()),
            }
        }
        if (index + 1) % 100 == 0 {
            log::info!("{} / {} images sent, {} dropped", index + 1, paths.len(), dropped);
        }
    }

    log::info!(
        "sent {} images, {} dropped ({:.1}%)",
        paths.len(),
        dropped,
        dropped as f64 * 100.0 / paths.len() as f64
    );

    if reference.is_some() {
        let json = serde_json::to_vec(&detections)?;
        std::fs::write(&args.out, json)
            .with_context(|| format!("write detections to {}", args.out.display()))?;
        log::info!(
            "{} reference detections written to {}",
            detections.len(),
            args.out.display()
        );
    }
    Ok(())
}

fn load_reference(path: &Path) -> Result<(Taxonomy, ImageIndex)> {
    let (taxonomy, images) = load_annotations(path)?;
    log::info!(
        "loaded {} categories and {} images from {}",
        taxonomy.len(),
        images.len(),
        path.display()
    );
    Ok((taxonomy, images))
}

/// Annotation id for an image file; numeric file stems are used when the file is not
/// listed.
fn image_id(images: &ImageIndex, path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    images
        .image_id(name)
        .or_else(|| path.file_stem()?.to_str()?.parse().ok())
}
