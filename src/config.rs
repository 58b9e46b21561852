use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::frame::{Rotation, DEFAULT_JPEG_QUALITY};
use crate::server::{EdgeServerConfig, DEFAULT_MAX_BODY_BYTES};
use crate::session::BridgeConfig;

const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_OFFLOAD_INTERVAL: u64 = 1;
const DEFAULT_FRAME_DELAY_MS: u64 = 25;

#[derive(Debug, Deserialize, Default)]
struct EdgeConfigFile {
    server: Option<ServerConfigFile>,
    client: Option<ClientConfigFile>,
    bridge: Option<BridgeConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
    refine_top_candidate: Option<bool>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    server_url: Option<String>,
    offload_interval: Option<u64>,
    jpeg_quality: Option<u32>,
    frame_delay_ms: Option<u64>,
    rotation: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub bridge_addr: String,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    /// Run the stage-2 classifier on the first stage-1 box.
    pub refine_top_candidate: bool,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    pub offload_interval: u64,
    pub jpeg_quality: u32,
    pub frame_delay: Duration,
    pub rotation: Rotation,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                addr: DEFAULT_SERVER_ADDR.to_string(),
                refine_top_candidate: true,
                max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            },
            client: ClientSettings {
                server_url: DEFAULT_SERVER_URL.to_string(),
                offload_interval: DEFAULT_OFFLOAD_INTERVAL,
                jpeg_quality: DEFAULT_JPEG_QUALITY as u32,
                frame_delay: Duration::from_millis(DEFAULT_FRAME_DELAY_MS),
                rotation: Rotation::None,
            },
            bridge_addr: DEFAULT_BRIDGE_ADDR.to_string(),
        }
    }
}

impl EdgeConfig {
    /// File named by `EDGE_CONFIG` (JSON, or TOML for `.toml`), then defaults, then
    /// `EDGE_*` environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EDGE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EdgeConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let server = file.server.unwrap_or_default();
        let client = file.client.unwrap_or_default();
        let rotation = match client.rotation {
            Some(degrees) => Rotation::from_degrees(degrees)?,
            None => defaults.client.rotation,
        };
        Ok(Self {
            server: ServerSettings {
                addr: server.addr.unwrap_or(defaults.server.addr),
                refine_top_candidate: server
                    .refine_top_candidate
                    .unwrap_or(defaults.server.refine_top_candidate),
                max_body_bytes: server
                    .max_body_bytes
                    .unwrap_or(defaults.server.max_body_bytes),
            },
            client: ClientSettings {
                server_url: client.server_url.unwrap_or(defaults.client.server_url),
                offload_interval: client
                    .offload_interval
                    .unwrap_or(defaults.client.offload_interval),
                jpeg_quality: client.jpeg_quality.unwrap_or(defaults.client.jpeg_quality),
                frame_delay: client
                    .frame_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.client.frame_delay),
                rotation,
            },
            bridge_addr: file
                .bridge
                .and_then(|bridge| bridge.addr)
                .unwrap_or(defaults.bridge_addr),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("EDGE_SERVER_ADDR") {
            self.server.addr = addr;
        }
        if let Some(raw) = non_empty_env("EDGE_REFINE_TOP_CANDIDATE") {
            self.server.refine_top_candidate = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(anyhow!("EDGE_REFINE_TOP_CANDIDATE must be true or false")),
            };
        }
        if let Some(url) = non_empty_env("EDGE_SERVER_URL") {
            self.client.server_url = url;
        }
        if let Some(raw) = non_empty_env("EDGE_OFFLOAD_INTERVAL") {
            self.client.offload_interval = raw
                .parse()
                .map_err(|_| anyhow!("EDGE_OFFLOAD_INTERVAL must be a positive integer"))?;
        }
        if let Some(raw) = non_empty_env("EDGE_JPEG_QUALITY") {
            self.client.jpeg_quality = raw
                .parse()
                .map_err(|_| anyhow!("EDGE_JPEG_QUALITY must be an integer between 1 and 100"))?;
        }
        if let Some(raw) = non_empty_env("EDGE_FRAME_DELAY_MS") {
            let millis: u64 = raw
                .parse()
                .map_err(|_| anyhow!("EDGE_FRAME_DELAY_MS must be an integer number of milliseconds"))?;
            self.client.frame_delay = Duration::from_millis(millis);
        }
        if let Some(addr) = non_empty_env("EDGE_BRIDGE_ADDR") {
            self.bridge_addr = addr;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.client.offload_interval == 0 {
            return Err(anyhow!("offload_interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.client.jpeg_quality) {
            return Err(anyhow!(
                "jpeg_quality must be between 1 and 100, got {}",
                self.client.jpeg_quality
            ));
        }
        let url = url::Url::parse(&self.client.server_url)
            .map_err(|e| anyhow!("invalid server_url '{}': {}", self.client.server_url, e))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(anyhow!(
                "server_url must use http or https, got '{}'",
                url.scheme()
            ));
        }
        if self.server.max_body_bytes == 0 {
            return Err(anyhow!("max_body_bytes must be greater than zero"));
        }
        Ok(())
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.client.jpeg_quality.clamp(1, 100) as u8
    }

    pub fn server_config(&self) -> EdgeServerConfig {
        EdgeServerConfig {
            addr: self.server.addr.clone(),
            max_body_bytes: self.server.max_body_bytes,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            addr: self.bridge_addr.clone(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<EdgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
