//! HLS delivery: per-path muxers and the HTTP endpoints serving them.
//!
//! The server implements [`SourceObserver`]: when a path gains a
//! publisher a muxer is spawned on the path's fan-out, when it loses one
//! the muxer is cancelled and its ring dropped. Endpoints:
//!
//! - `GET /hls/<path>/index.m3u8` for the live playlist
//! - `GET /hls/<path>/<seq>.ts` for one segment

pub mod aac;
pub mod h264;
pub mod mpegts;
pub mod muxer;
pub mod playlist;

use crate::error::{HlsError, NvrError, Result};
use crate::path::SourceObserver;
use crate::rtsp::stream::SharedStream;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use muxer::{HlsMuxer, MuxerConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct MuxerEntry {
    muxer: Arc<HlsMuxer>,
    token: CancellationToken,
}

pub struct HlsServer {
    config: MuxerConfig,
    muxers: Mutex<HashMap<String, MuxerEntry>>,
    /// Bumped on registration so lookups can wait for a muxer to appear
    registered: watch::Sender<u64>,
}

impl HlsServer {
    pub fn new(config: MuxerConfig) -> Arc<Self> {
        let (registered, _) = watch::channel(0);
        Arc::new(Self {
            config,
            muxers: Mutex::new(HashMap::new()),
            registered,
        })
    }

    /// Serve the endpoints until the token fires
    pub async fn run(self: Arc<Self>, port: u16, token: CancellationToken) -> Result<()> {
        let app = Router::new()
            .route("/hls/{path}/{file}", get(serve_file))
            .with_state(Arc::clone(&self));

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(NvrError::Io)?;
        info!(addr = %listener.local_addr().map_err(NvrError::Io)?, "HLS server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .map_err(NvrError::Io)?;

        info!("HLS server stopped");
        Ok(())
    }

    pub fn muxer(&self, path_name: &str) -> Option<Arc<HlsMuxer>> {
        self.muxers
            .lock()
            .get(path_name)
            .map(|entry| Arc::clone(&entry.muxer))
    }

    /// Look up a path's muxer, waiting bounded for it to register and
    /// publish its first segment.
    pub async fn muxer_by_path_name(
        &self,
        path_name: &str,
        timeout: Duration,
    ) -> std::result::Result<Arc<HlsMuxer>, HlsError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut receiver = self.registered.subscribe();

        let muxer = loop {
            // Mark the current registration count seen before checking the
            // map, so an insert between the check and the wait still wakes
            // the next changed().
            receiver.borrow_and_update();
            if let Some(muxer) = self.muxer(path_name) {
                break muxer;
            }
            match tokio::time::timeout_at(deadline, receiver.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    return Err(HlsError::MuxerTimeout {
                        path: path_name.to_string(),
                        timeout,
                    })
                }
            }
        };

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        muxer.wait_for_segment(remaining).await?;
        Ok(muxer)
    }
}

impl SourceObserver for HlsServer {
    fn source_ready(&self, path_name: &str, stream: Arc<SharedStream>) {
        let muxer = match HlsMuxer::new(path_name, stream.tracks(), self.config.clone()) {
            Ok(muxer) => muxer,
            Err(err) => {
                warn!(path = path_name, %err, "not muxing path");
                return;
            }
        };

        let token = CancellationToken::new();
        {
            let mut muxers = self.muxers.lock();
            if let Some(previous) = muxers.remove(path_name) {
                previous.token.cancel();
            }
            muxers.insert(
                path_name.to_string(),
                MuxerEntry {
                    muxer: Arc::clone(&muxer),
                    token: token.clone(),
                },
            );
        }
        self.registered.send_modify(|count| *count += 1);

        tokio::spawn(muxer.run(stream, token));
    }

    fn source_not_ready(&self, path_name: &str) {
        let removed = self.muxers.lock().remove(path_name);
        if let Some(entry) = removed {
            entry.token.cancel();
            info!(path = path_name, "muxer dropped");
        }
    }
}

async fn serve_file(
    State(server): State<Arc<HlsServer>>,
    UrlPath((path_name, file)): UrlPath<(String, String)>,
) -> Response {
    let Some(muxer) = server.muxer(&path_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if file == "index.m3u8" {
        return match muxer.playlist() {
            Some(playlist) => (
                [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
                playlist,
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    let Some(sequence) = file
        .strip_suffix(".ts")
        .and_then(|seq| seq.parse::<u64>().ok())
    else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match muxer.segment(sequence) {
        Some(data) => ([(header::CONTENT_TYPE, "video/mp2t")], data).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
