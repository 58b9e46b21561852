//! Device-side command bridge.
//!
//! Serves the persistent command protocol (see [`crate::transport::command`]) to an
//! evaluation driver. Each accepted connection is one [`Session`] with its own
//! settings; within a session commands are handled strictly one after another. `JPG`
//! payloads are offloaded synchronously through the same [`OffloadTransport`] the
//! capture-side dispatcher uses, and the outcome is written back as one JSON line.

use anyhow::{anyhow, Result};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::offload::OffloadTransport;
use crate::transport::command::{
    read_line, read_payload, write_line, Command, DetectionLine, MAX_PAYLOAD_BYTES, OK,
};
use crate::transport::http::decode_response;
use crate::transport::ClientTimings;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub addr: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Values received through `SET`, kept as sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSettings {
    values: BTreeMap<String, String>,
}

impl SessionSettings {
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn use_camera(&self) -> bool {
        self.get("use_camera").map(parse_flag).unwrap_or(false)
    }

    pub fn udp(&self) -> bool {
        self.get("udp").map(parse_flag).unwrap_or(false)
    }

    /// Re-encode quality, when one was set and is a number in `0..=100`.
    pub fn jpeg_quality(&self) -> Option<u8> {
        self.get("jpeg_quality")
            .and_then(|raw| raw.trim().parse::<u8>().ok())
            .filter(|q| *q <= 100)
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// One command connection.
pub struct Session {
    settings: SessionSettings,
    transport: Arc<dyn OffloadTransport>,
}

impl Session {
    pub fn new(transport: Arc<dyn OffloadTransport>) -> Self {
        Self {
            settings: SessionSettings::default(),
            transport,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Serve commands until the peer closes. Framing errors end the session with `Err`.
    pub fn serve<R: BufRead, W: Write>(&mut self, reader: &mut R, writer: &mut W) -> Result<()> {
        while let Some(line) = read_line(reader)? {
            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(err) => {
                    log::warn!("command '{}' rejected: {}", line, err);
                    write_line(writer, &format!("error {}", err))?;
                    continue;
                }
            };
            match command {
                Command::Set { key, value } => {
                    self.apply_setting(&key, &value);
                    write_line(writer, OK)?;
                }
                Command::Jpg { len } => {
                    if len > MAX_PAYLOAD_BYTES {
                        write_line(writer, "error payload too large")?;
                        return Err(anyhow!(
                            "JPG of {} bytes exceeds {} byte limit",
                            len,
                            MAX_PAYLOAD_BYTES
                        ));
                    }
                    let payload = read_payload(reader, len)?;
                    write_line(writer, OK)?;
                    let result = self.process_jpg(&payload);
                    write_line(writer, &result.to_json()?)?;
                }
            }
        }
        Ok(())
    }

    fn apply_setting(&mut self, key: &str, value: &str) {
        log::info!("SET {} {}", key, value);
        self.settings.set(key, value);
        match key {
            "use_camera" if self.settings.use_camera() => {
                log::info!("bridge has no camera; frames only arrive through JPG")
            }
            "udp" if self.settings.udp() => {
                log::info!("udp requested; bridge transport stays on tcp")
            }
            "jpeg_quality" if self.settings.jpeg_quality().is_none() => {
                log::warn!("jpeg_quality '{}' is not in 0..=100, payloads sent as-is", value)
            }
            "use_camera" | "udp" | "jpeg_quality" => {}
            other => log::debug!("unrecognised setting '{}' stored", other),
        }
    }

    /// Offload one payload. Never fails; problems become a dropped line.
    pub fn process_jpg(&self, payload: &[u8]) -> DetectionLine {
        let started = Instant::now();
        let jpeg = match self.settings.jpeg_quality() {
            Some(quality) => match Frame::decode(payload).and_then(|f| f.to_jpeg(quality)) {
                Ok(encoded) => Cow::Owned(encoded),
                Err(err) => {
                    log::warn!("JPG payload could not be re-encoded: {:#}", err);
                    return DetectionLine::dropped(ClientTimings::measured(
                        started.elapsed(),
                        Duration::ZERO,
                        started.elapsed(),
                        None,
                    ));
                }
            },
            None => Cow::Borrowed(payload),
        };
        let encode = started.elapsed();

        let sent = Instant::now();
        let response = self
            .transport
            .round_trip(&jpeg)
            .and_then(|body| decode_response(&body));
        let round_trip = sent.elapsed();

        match response {
            Ok(Some(response)) => {
                let timings = ClientTimings::measured(
                    encode,
                    round_trip,
                    started.elapsed(),
                    Some(&response.server_timings),
                );
                DetectionLine::completed(&response.boxes(), timings, response.server_timings)
            }
            Ok(None) => {
                log::warn!("JPG dropped: server answered with an empty body");
                DetectionLine::dropped(ClientTimings::measured(
                    encode,
                    round_trip,
                    started.elapsed(),
                    None,
                ))
            }
            Err(err) => {
                log::warn!("JPG dropped: {:#}", err);
                DetectionLine::dropped(ClientTimings::measured(
                    encode,
                    round_trip,
                    started.elapsed(),
                    None,
                ))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct BridgeHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("command bridge thread panicked"))?;
        }
        Ok(())
    }
}

pub struct CommandBridge {
    cfg: BridgeConfig,
    transport: Arc<dyn OffloadTransport>,
}

impl CommandBridge {
    pub fn new(cfg: BridgeConfig, transport: Arc<dyn OffloadTransport>) -> Self {
        Self { cfg, transport }
    }

    pub fn spawn(self) -> Result<BridgeHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("command bridge listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let transport = self.transport;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_bridge(listener, transport, shutdown_thread) {
                log::error!("command bridge stopped: {}", err);
            }
        });

        Ok(BridgeHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_bridge(
    listener: TcpListener,
    transport: Arc<dyn OffloadTransport>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let transport = Arc::clone(&transport);
                std::thread::spawn(move || {
                    log::info!("command session opened by {}", peer);
                    match handle_session(stream, transport) {
                        Ok(()) => log::info!("command session with {} closed", peer),
                        Err(err) => log::warn!("command session with {} ended: {:#}", peer, err),
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_session(stream: TcpStream, transport: Arc<dyn OffloadTransport>) -> Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    Session::new(transport).serve(&mut reader, &mut writer)
}
