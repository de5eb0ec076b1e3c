//! Streaming client for the object-detection service.
//!
//! The service speaks a bidirectional stream of length-delimited JSON
//! messages over TCP: each request frame carries one PNG image, each
//! response frame the detections for it. Requests and responses alternate
//! strictly, which doubles as flow control for the frame feed.

use crate::error::DetectorError;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

/// Dial timeout for the service
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
pub struct DetectRequest {
    #[serde(rename = "detectorName")]
    pub detector_name: String,
    /// PNG-encoded frame
    pub data: Vec<u8>,
    /// Label filter forwarded to the service; scores below are not
    /// returned
    pub detect: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

/// One detection in detector-space coordinates (0..1)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawDetection {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub confidence: f64,
    pub label: String,
}

#[derive(Debug)]
pub struct DetectorClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl DetectorClient {
    /// Dial the service, bounded by [`DIAL_TIMEOUT`]
    pub async fn connect(addr: &str) -> Result<Self, DetectorError> {
        let dial = |details: String| DetectorError::Dial {
            addr: addr.to_string(),
            details,
        };

        let socket = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| dial("dial timeout".to_string()))?
            .map_err(|err| dial(err.to_string()))?;

        debug!(addr, "detector connected");
        Ok(Self {
            framed: Framed::new(socket, LengthDelimitedCodec::new()),
        })
    }

    /// Send one frame and await its detections
    pub async fn detect(&mut self, request: &DetectRequest) -> Result<DetectResponse, DetectorError> {
        let stream_err = |details: String| DetectorError::Stream { details };

        let encoded = serde_json::to_vec(request)
            .map_err(|err| stream_err(format!("encode: {}", err)))?;
        self.framed
            .send(encoded.into())
            .await
            .map_err(|err| stream_err(format!("send: {}", err)))?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| stream_err("service closed the stream".to_string()))?
            .map_err(|err| stream_err(format!("recv: {}", err)))?;

        serde_json::from_slice(&frame).map_err(|err| stream_err(format!("decode: {}", err)))
    }
}
