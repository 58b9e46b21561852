//! Stateless request/response codec.
//!
//! Request: `POST /api/edge_app2[?r=<degrees>]`, `content-type: image/jpeg`, body is
//! the encoded frame. Response: a JSON document
//!
//! ```text
//! { "results": [ {"title", "confidence", "x", "y", "w", "h"} ... ],
//!   "server_timings": { "jpeg_decode", "rot", "yolo", "size", "tot" } }
//! ```
//!
//! where `x`/`y` are the box centre and `w`/`h` its full size. An empty body with a
//! success status means the server did not run detection for this request.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};

use crate::detect::DetectionBox;

pub const EDGE_APP_PATH: &str = "/api/edge_app2";
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";
pub const JSON_CONTENT_TYPE: &str = "application/json";

const MAX_HEADER_BYTES: usize = 8192;

/// One detection as carried in the HTTP response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireBox {
    pub title: String,
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl From<&DetectionBox> for WireBox {
    fn from(b: &DetectionBox) -> Self {
        let (x, y) = b.center();
        Self {
            title: b.label.clone(),
            confidence: b.confidence,
            x,
            y,
            w: b.width(),
            h: b.height(),
        }
    }
}

impl From<&WireBox> for DetectionBox {
    fn from(b: &WireBox) -> Self {
        DetectionBox::from_center(b.title.clone(), b.confidence, b.x, b.y, b.w, b.h)
    }
}

/// Server-side timings in milliseconds; `size` is the request body length in bytes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerTimings {
    pub jpeg_decode: f64,
    pub rot: f64,
    pub yolo: f64,
    pub size: usize,
    pub tot: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeResponse {
    pub results: Vec<WireBox>,
    #[serde(default)]
    pub server_timings: ServerTimings,
}

impl EdgeResponse {
    pub fn from_boxes(boxes: &[DetectionBox], server_timings: ServerTimings) -> Self {
        Self {
            results: boxes.iter().map(WireBox::from).collect(),
            server_timings,
        }
    }

    /// Boxes in edge form, in response order.
    pub fn boxes(&self) -> Vec<DetectionBox> {
        self.results.iter().map(DetectionBox::from).collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Decode a response body. Empty (or whitespace-only) bodies yield `Ok(None)`.
pub fn decode_response(body: &[u8]) -> Result<Option<EdgeResponse>> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    let response = serde_json::from_slice(body).context("malformed detection response")?;
    Ok(Some(response))
}

// ----------------------------------------------------------------------------
// Server side: request parsing and response writing
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Read one request (headers plus a `Content-Length` body of at most `max_body` bytes).
pub fn read_request<R: Read>(stream: &mut R, max_body: usize) -> Result<HttpRequest> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_header_end(&data) {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, Vec::new()),
    };

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(anyhow!(
            "request body of {} bytes exceeds limit of {}",
            content_length,
            max_body
        ));
    }

    let mut body = data[header_end + 4..].to_vec();
    if body.len() > content_length {
        body.truncate(content_length);
    } else if body.len() < content_length {
        let already = body.len();
        body.resize(content_length, 0);
        stream
            .read_exact(&mut body[already..])
            .with_context(|| format!("request body ended early, expected {} bytes", content_length))?;
    }

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body,
    })
}

pub fn write_json_response<W: Write>(stream: &mut W, status: u16, body: &[u8]) -> Result<()> {
    write_response(stream, status, Some(JSON_CONTENT_TYPE), body)
}

/// Success status, no body: the request was not processed.
pub fn write_empty_response<W: Write>(stream: &mut W) -> Result<()> {
    write_response(stream, 200, None, &[])
}

pub fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!("{status_line}\r\n");
    if let Some(content_type) = content_type {
        header.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    header.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
