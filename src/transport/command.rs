//! Persistent-connection command protocol.
//!
//! One long-lived TCP connection carries newline-terminated ASCII command lines:
//!
//! | Command | Response |
//! |---|---|
//! | `SET <key> <value>\n` | `ok\n` |
//! | `JPG <n>\n` + `n` raw bytes | `ok\n`, then one JSON line |
//!
//! The JSON line is a [`DetectionLine`]. The protocol is strictly synchronous: no
//! command is read until the previous response line has been written. Any reply
//! other than the literal `ok` is fatal for the caller.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use super::http::ServerTimings;
use super::ClientTimings;
use crate::detect::{DetectionBox, DetectionResult};

pub const OK: &str = "ok";

/// Longest accepted command or acknowledgement line, terminator included.
pub const MAX_LINE_BYTES: usize = 4096;

/// Longest accepted JSON result line. A result carries one entry per box, so it gets
/// the same ceiling as a payload rather than a command line.
pub const MAX_RESULT_LINE_BYTES: usize = MAX_PAYLOAD_BYTES;

/// Largest `JPG` payload accepted.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Jpg { len: usize },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.trim_end_matches(['\r', '\n']).splitn(3, ' ');
        match parts.next() {
            Some("SET") => {
                let key = parts
                    .next()
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| anyhow!("SET missing key"))?;
                let value = parts.next().ok_or_else(|| anyhow!("SET missing value"))?;
                Ok(Command::Set {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            Some("JPG") => {
                let raw = parts.next().ok_or_else(|| anyhow!("JPG missing length"))?;
                if parts.next().is_some() {
                    return Err(anyhow!("JPG takes a single length"));
                }
                let len = raw
                    .parse::<usize>()
                    .map_err(|_| anyhow!("JPG length '{}' is not a byte count", raw))?;
                Ok(Command::Jpg { len })
            }
            Some(other) => Err(anyhow!("unknown command '{}'", other)),
            None => Err(anyhow!("empty command")),
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Command::Set { key, value } => format!("SET {key} {value}\n"),
            Command::Jpg { len } => format!("JPG {len}\n"),
        }
    }
}

/// Read a command or acknowledgement line up to and including the next `\n`. Returns
/// the line without terminator, or `None` when the peer closed the connection before
/// sending anything.
pub fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    read_bounded_line(reader, MAX_LINE_BYTES)
}

/// Like [`read_line`], for the JSON line that follows a `JPG` acknowledgement.
pub fn read_result_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    read_bounded_line(reader, MAX_RESULT_LINE_BYTES)
}

fn read_bounded_line<R: BufRead>(reader: &mut R, limit: usize) -> Result<Option<String>> {
    let mut line = Vec::new();
    let n = reader
        .by_ref()
        .take(limit as u64)
        .read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if line.len() >= limit {
            return Err(anyhow!("line longer than {} bytes", limit));
        }
        // Peer closed mid-line; hand back what arrived.
    } else {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| anyhow!("line is not valid utf-8"))
}

/// Read exactly `len` payload bytes.
pub fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .with_context(|| format!("payload ended before {} bytes", len))?;
    Ok(payload)
}

pub fn write_line<W: Write>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

// ----------------------------------------------------------------------------
// JSON result line
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineBox {
    pub title: String,
    pub confidence: f32,
    pub left: i32,
    pub right: i32,
    pub top: i32,
    pub bottom: i32,
}

impl From<&DetectionBox> for LineBox {
    fn from(b: &DetectionBox) -> Self {
        Self {
            title: b.label.clone(),
            confidence: b.confidence,
            left: b.left,
            right: b.right,
            top: b.top,
            bottom: b.bottom,
        }
    }
}

impl From<&LineBox> for DetectionBox {
    fn from(b: &LineBox) -> Self {
        DetectionBox::new(b.title.clone(), b.confidence, b.left, b.top, b.right, b.bottom)
    }
}

/// Reply to one `JPG` command. `server_timings` is `null` when the image was dropped
/// (offload failed, rejected or unreadable).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionLine {
    pub results: Vec<LineBox>,
    pub client_timings: ClientTimings,
    pub server_timings: Option<ServerTimings>,
}

impl DetectionLine {
    pub fn completed(
        boxes: &[DetectionBox],
        client_timings: ClientTimings,
        server_timings: ServerTimings,
    ) -> Self {
        Self {
            results: boxes.iter().map(LineBox::from).collect(),
            client_timings,
            server_timings: Some(server_timings),
        }
    }

    pub fn dropped(client_timings: ClientTimings) -> Self {
        Self {
            results: Vec::new(),
            client_timings,
            server_timings: None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.server_timings.is_none()
    }

    pub fn boxes(&self) -> Vec<DetectionBox> {
        self.results.iter().map(DetectionBox::from).collect()
    }

    /// Full detection result, or `None` for a dropped image.
    pub fn to_result(&self) -> Option<DetectionResult> {
        let server = self.server_timings.as_ref()?;
        Some(DetectionResult::new(
            self.boxes(),
            self.client_timings.combine(server),
        ))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ----------------------------------------------------------------------------
// Client (evaluation harness side)
// ----------------------------------------------------------------------------

/// Caller side of the command protocol.
pub struct CommandClient {
    stream: BufReader<TcpStream>,
}

impl CommandClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).context("connect to command bridge")?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// `SET <key> <value>`; fails unless the bridge answers `ok`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let command = Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.send(&command, &[])?;
        self.expect_ok(&command)
    }

    /// Send one JPEG and return the raw JSON line that follows the `ok`.
    pub fn process_jpg(&mut self, jpeg: &[u8]) -> Result<String> {
        let command = Command::Jpg { len: jpeg.len() };
        self.send(&command, jpeg)?;
        self.expect_ok(&command)?;
        read_result_line(&mut self.stream)?
            .ok_or_else(|| anyhow!("connection closed before detection line"))
    }

    fn send(&mut self, command: &Command, payload: &[u8]) -> Result<()> {
        let writer = self.stream.get_mut();
        writer.write_all(command.to_line().as_bytes())?;
        writer.write_all(payload)?;
        writer.flush()?;
        Ok(())
    }

    fn expect_ok(&mut self, command: &Command) -> Result<()> {
        let reply = read_line(&mut self.stream)?.unwrap_or_default();
        if reply != OK {
            return Err(anyhow!(
                "{} : {}",
                command.to_line().trim_end(),
                reply
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    #[test]
    fn parses_set_and_jpg() {
        assert_eq!(
            Command::parse("SET jpeg_quality 100").unwrap(),
            Command::Set {
                key: "jpeg_quality".into(),
                value: "100".into()
            }
        );
        assert_eq!(
            Command::parse("JPG 1234\n").unwrap(),
            Command::Jpg { len: 1234 }
        );
        assert_eq!(Command::Jpg { len: 7 }.to_line(), "JPG 7\n");
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("GET /").is_err());
        assert!(Command::parse("JPG").is_err());
        assert!(Command::parse("JPG -4").is_err());
        assert!(Command::parse("JPG 4 5").is_err());
        assert!(Command::parse("SET use_camera").is_err());
    }

    #[test]
    fn read_line_splits_on_newline() {
        let mut reader = Cursor::new(b"ok\r\n{\"a\":1}\npartial".to_vec());
        assert_eq!(read_line(&mut reader).unwrap().as_deref(), Some("ok"));
        assert_eq!(read_line(&mut reader).unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(read_line(&mut reader).unwrap().as_deref(), Some("partial"));
        assert_eq!(read_line(&mut reader).unwrap(), None);
    }

    #[test]
    fn read_line_rejects_unterminated_long_lines() {
        let mut reader = Cursor::new(vec![b'a'; MAX_LINE_BYTES + 10]);
        assert!(read_line(&mut reader).is_err());
    }

    #[test]
    fn client_reads_result_lines_longer_than_a_command_line() {
        let boxes: Vec<DetectionBox> = (0..64)
            .map(|i| DetectionBox::new("pottedplant", 0.5, i, i, i + 31, i + 27))
            .collect();
        let line = DetectionLine::completed(
            &boxes,
            ClientTimings::default(),
            ServerTimings::default(),
        )
        .to_json()
        .unwrap();
        assert!(line.len() > MAX_LINE_BYTES);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let reply = line.clone();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            assert_eq!(read_line(&mut reader).unwrap().unwrap(), "JPG 3");
            assert_eq!(read_payload(&mut reader, 3).unwrap(), b"abc");
            write_line(reader.get_mut(), OK).unwrap();
            write_line(reader.get_mut(), &reply).unwrap();
        });

        let mut client = CommandClient::connect(addr).unwrap();
        let raw = client.process_jpg(b"abc").unwrap();
        assert_eq!(raw, line);
        let parsed: DetectionLine = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.boxes(), boxes);
        server.join().unwrap();
    }

    #[test]
    fn read_payload_requires_exact_length() {
        let mut reader = Cursor::new(b"abcdef".to_vec());
        assert_eq!(read_payload(&mut reader, 4).unwrap(), b"abcd");
        assert!(read_payload(&mut reader, 4).is_err());
    }

    #[test]
    fn dropped_line_serialises_null_timings() {
        let line = DetectionLine::dropped(ClientTimings::default());
        let json = line.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["server_timings"].is_null());
        assert_eq!(value["results"].as_array().unwrap().len(), 0);
        assert!(line.to_result().is_none());
    }

    #[test]
    fn client_fails_on_non_ok_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let line = read_line(&mut reader).unwrap().unwrap();
            assert_eq!(line, "SET udp maybe");
            write_line(reader.get_mut(), "error bad value").unwrap();
        });

        let mut client = CommandClient::connect(addr).unwrap();
        let err = client.set("udp", "maybe").unwrap_err();
        assert!(err.to_string().contains("SET udp maybe : error bad value"));
        server.join().unwrap();
    }
}
