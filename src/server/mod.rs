//! Detection server.
//!
//! Serves `POST /api/edge_app2`: decode the JPEG body, optionally rotate it (`?r=`),
//! run the cascade and answer with boxes plus server timings. Each connection gets its
//! own thread; the cascade itself runs one frame at a time behind a mutex. A client
//! address with a request already admitted gets an empty `200 OK` and no detection.

use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::admission::AdmissionController;
use crate::detect::Cascade;
use crate::frame::{Frame, Rotation};
use crate::transport::http::{
    read_request, write_empty_response, write_json_response, EdgeResponse, HttpRequest,
    ServerTimings, EDGE_APP_PATH,
};
use crate::transport::millis;

/// Largest accepted request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1_024_000;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct EdgeServerConfig {
    pub addr: String,
    pub max_body_bytes: usize,
}

impl Default for EdgeServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug)]
pub struct EdgeServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl EdgeServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("edge server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct EdgeServer {
    cfg: EdgeServerConfig,
    cascade: Cascade,
    admission: AdmissionController,
}

struct ServerState {
    cfg: EdgeServerConfig,
    cascade: Mutex<Cascade>,
    admission: AdmissionController,
}

impl EdgeServer {
    pub fn new(cfg: EdgeServerConfig, cascade: Cascade) -> Self {
        Self {
            cfg,
            cascade,
            admission: AdmissionController::new(),
        }
    }

    /// Shared admission state, for inspection.
    pub fn admission(&self) -> AdmissionController {
        self.admission.clone()
    }

    pub fn spawn(mut self) -> Result<EdgeServerHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid server address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        self.cascade.warm_up()?;
        log::info!(
            "edge server listening on {} (detector={}, refine_top_candidate={})",
            addr,
            self.cascade.detector_name(),
            self.cascade.refines_top_candidate()
        );

        let state = Arc::new(ServerState {
            cfg: self.cfg,
            cascade: Mutex::new(self.cascade),
            admission: self.admission,
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, state, shutdown_thread) {
                log::error!("edge server stopped: {}", err);
            }
        });

        Ok(EdgeServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                let spawned = std::thread::Builder::new()
                    .name(format!("edge-conn-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, peer, &state) {
                            log::warn!("edge request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("could not start handler for {}: {}", peer, err);
                }
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

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, state: &ServerState) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let request = match read_request(&mut stream, state.cfg.max_body_bytes) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, br#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, br#"{"status":"ok"}"#),
        ("POST", EDGE_APP_PATH) => handle_detect(&mut stream, peer.ip(), &request, state),
        (_, EDGE_APP_PATH) | (_, "/health") => {
            write_json_response(&mut stream, 405, br#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, br#"{"error":"not_found"}"#),
    }
}

fn handle_detect(
    stream: &mut TcpStream,
    client: IpAddr,
    request: &HttpRequest,
    state: &ServerState,
) -> Result<()> {
    // Held until the response has been written.
    let Some(_admitted) = state.admission.try_admit(client) else {
        log::debug!("{} already has a request in flight, answering empty", client);
        return write_empty_response(stream);
    };

    if request.header("content-length").is_none() {
        write_json_response(stream, 400, br#"{"error":"missing_content_length"}"#)?;
        return Err(anyhow!("request without content-length"));
    }

    let started = Instant::now();
    let frame = match Frame::decode(&request.body) {
        Ok(frame) => frame,
        Err(err) => {
            write_json_response(stream, 400, br#"{"error":"undecodable_image"}"#)?;
            return Err(err);
        }
    };
    let jpeg_decode = started.elapsed();

    let rotation = requested_rotation(request);
    let rotate_started = Instant::now();
    let frame = match rotation {
        Rotation::None => frame,
        rotation => frame.rotate(rotation),
    };
    let rot = rotate_started.elapsed();

    let detect_started = Instant::now();
    let run = match state.cascade.lock() {
        Ok(mut cascade) => cascade.run(&frame),
        Err(_) => Err(anyhow!("detection cascade lock poisoned")),
    };
    let boxes = match run {
        Ok(boxes) => boxes,
        Err(err) => {
            write_json_response(stream, 500, br#"{"error":"detection_failed"}"#)?;
            return Err(err);
        }
    };
    let yolo = detect_started.elapsed();

    let timings = ServerTimings {
        jpeg_decode: millis(jpeg_decode),
        rot: millis(rot),
        yolo: millis(yolo),
        size: request.body.len(),
        tot: millis(started.elapsed()),
    };
    log::debug!(
        "{}: {} boxes, {} bytes, decode {:.1}ms rot {:.1}ms detect {:.1}ms total {:.1}ms",
        client,
        boxes.len(),
        timings.size,
        timings.jpeg_decode,
        timings.rot,
        timings.yolo,
        timings.tot
    );
    let body = EdgeResponse::from_boxes(&boxes, timings).to_json()?;
    write_json_response(stream, 200, &body)
}

/// `?r=<degrees>`; anything unparseable counts as no rotation.
fn requested_rotation(request: &HttpRequest) -> Rotation {
    let Some(raw) = request.query_param("r") else {
        return Rotation::None;
    };
    match raw.parse::<i32>().map_err(anyhow::Error::from).and_then(Rotation::from_degrees) {
        Ok(rotation) => rotation,
        Err(err) => {
            log::warn!("ignoring rotation '{}': {}", raw, err);
            Rotation::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request(raw: &str) -> HttpRequest {
        read_request(&mut Cursor::new(raw.as_bytes().to_vec()), 1024).unwrap()
    }

    #[test]
    fn rotation_query_is_parsed_leniently() {
        let with = |q: &str| {
            requested_rotation(&request(&format!(
                "POST /api/edge_app2{} HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
                q
            )))
        };
        assert_eq!(with(""), Rotation::None);
        assert_eq!(with("?r=90"), Rotation::Cw90);
        assert_eq!(with("?r=-90"), Rotation::Cw270);
        assert_eq!(with("?r=45"), Rotation::None);
        assert_eq!(with("?r=sideways"), Rotation::None);
    }
}
