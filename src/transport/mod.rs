//! Wire formats between capture devices and the detection server.
//!
//! - `http`: stateless `POST /api/edge_app2` request/response codec.
//! - `command`: persistent line protocol (`SET` / `JPG <n>`) used for controlled runs.
//!
//! Both carry the same payload semantics: an encoded frame goes out, a list of
//! labelled boxes plus a timing breakdown comes back.

pub mod command;
pub mod http;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::detect::Timings;
use http::ServerTimings;

/// Client-side timings in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTimings {
    pub jpeg_encode: f64,
    pub net: f64,
    pub tot: f64,
}

impl ClientTimings {
    /// `net` is the round trip minus the time the server reports spending on the request.
    pub fn measured(
        encode: Duration,
        round_trip: Duration,
        total: Duration,
        server: Option<&ServerTimings>,
    ) -> Self {
        let server_ms = server.map(|s| s.tot).unwrap_or(0.0);
        Self {
            jpeg_encode: millis(encode),
            net: (millis(round_trip) - server_ms).max(0.0),
            tot: millis(total),
        }
    }

    /// Merge with the server's report into the pipeline-wide breakdown.
    pub fn combine(&self, server: &ServerTimings) -> Timings {
        Timings {
            decode: server.jpeg_decode,
            rotate: server.rot,
            encode: self.jpeg_encode,
            detect: server.yolo,
            network: self.net,
            client_total: self.tot,
            server_total: server.tot,
            payload_size: server.size,
        }
    }
}

pub fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
