use anyhow::Result;
use serde_json::Value;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use edge_offload::server::{EdgeServer, EdgeServerConfig, EdgeServerHandle};
use edge_offload::session::{BridgeConfig, BridgeHandle, CommandBridge};
use edge_offload::{
    Cascade, CommandClient, DetectionBox, DetectionLine, Detector, Frame, HttpTransport, Rotation,
};

struct FixedDetector;

impl Detector for FixedDetector {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectionBox>> {
        Ok(vec![DetectionBox::new("tvmonitor", 0.75, 8, 6, 28, 26)])
    }
}

/// Edge server plus a bridge in front of it; both stopped on drop.
struct Rig {
    server: Option<EdgeServerHandle>,
    bridge: Option<BridgeHandle>,
}

impl Rig {
    fn start() -> Result<Self> {
        let server = EdgeServer::new(
            EdgeServerConfig {
                addr: "127.0.0.1:0".to_string(),
                ..EdgeServerConfig::default()
            },
            Cascade::new(FixedDetector),
        )
        .spawn()?;
        let url = format!("http://{}", server.addr);
        let bridge = start_bridge(&url)?;
        Ok(Self {
            server: Some(server),
            bridge: Some(bridge),
        })
    }

    fn bridge_addr(&self) -> SocketAddr {
        self.bridge.as_ref().unwrap().addr
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.stop();
        }
        if let Some(server) = self.server.take() {
            let _ = server.stop();
        }
    }
}

fn start_bridge(server_url: &str) -> Result<BridgeHandle> {
    let transport = Arc::new(HttpTransport::new(server_url, Rotation::None)?);
    CommandBridge::new(
        BridgeConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        transport,
    )
    .spawn()
}

fn jpeg() -> Vec<u8> {
    Frame::filled(48, 40, [30, 90, 150]).to_jpeg(90).unwrap()
}

fn read_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line.trim_end_matches('\n').to_string())
}

#[test]
fn client_session_round_trip() -> Result<()> {
    let rig = Rig::start()?;
    let mut client = CommandClient::connect(rig.bridge_addr())?;
    client.set("use_camera", "false")?;
    client.set("jpeg_quality", "80")?;
    client.set("udp", "false")?;

    for _ in 0..3 {
        let raw = client.process_jpg(&jpeg())?;
        let line: DetectionLine = serde_json::from_str(&raw)?;
        assert!(!line.is_dropped());
        assert_eq!(line.results.len(), 1);
        assert_eq!(line.results[0].title, "tvmonitor");
        assert_eq!(
            (line.results[0].left, line.results[0].right, line.results[0].top, line.results[0].bottom),
            (8, 28, 6, 26)
        );
        assert!(line.client_timings.tot >= line.client_timings.jpeg_encode);

        let result = line.to_result().unwrap();
        assert!(result.timings.payload_size > 0);
    }
    Ok(())
}

#[test]
fn partial_payload_gets_no_early_ok() -> Result<()> {
    let rig = Rig::start()?;
    let mut stream = TcpStream::connect(rig.bridge_addr())?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let payload = vec![0x5A; 1234];
    stream.write_all(b"JPG 1234\n")?;
    stream.write_all(&payload[..1000])?;
    stream.flush()?;

    reader
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(300)))?;
    let mut byte = [0u8; 1];
    match reader.read(&mut byte) {
        Err(err) => assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)),
        Ok(n) => panic!("bridge answered {} byte(s) before the payload was complete", n),
    }

    reader.get_ref().set_read_timeout(Some(Duration::from_secs(15)))?;
    stream.write_all(&payload[1000..])?;
    assert_eq!(read_line(&mut reader)?, "ok");

    // Not a JPEG, so the server refuses it and the line reports a dropped image.
    let json: Value = serde_json::from_str(&read_line(&mut reader)?)?;
    assert!(json["server_timings"].is_null());
    assert_eq!(json["results"].as_array().unwrap().len(), 0);
    assert!(json["client_timings"]["tot"].as_f64().is_some());

    stream.write_all(b"SET udp false\n")?;
    assert_eq!(read_line(&mut reader)?, "ok");
    Ok(())
}

#[test]
fn unknown_command_gets_non_ok_reply() -> Result<()> {
    let rig = Rig::start()?;
    let mut stream = TcpStream::connect(rig.bridge_addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(15)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    stream.write_all(b"PNG 12\n")?;
    let reply = read_line(&mut reader)?;
    assert_ne!(reply, "ok");
    assert!(reply.starts_with("error"));

    stream.write_all(b"SET use_camera false\n")?;
    assert_eq!(read_line(&mut reader)?, "ok");
    Ok(())
}

#[test]
fn unreachable_server_yields_dropped_line() -> Result<()> {
    // Bind and release a port so nothing is listening on it.
    let free = TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let bridge = start_bridge(&format!("http://{}", free))?;

    let mut client = CommandClient::connect(bridge.addr)?;
    let raw = client.process_jpg(&jpeg())?;
    let line: DetectionLine = serde_json::from_str(&raw)?;
    assert!(line.is_dropped());
    assert!(line.results.is_empty());

    drop(client);
    bridge.stop()?;
    Ok(())
}
