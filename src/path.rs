//! Named live-stream registry.
//!
//! A path is the rendezvous between one publisher and any number of
//! readers. The manager serializes all operations on one mutex; path
//! close never runs under that mutex, so a session blocking on its own
//! lock can never deadlock against the manager (lock order is always
//! session → manager).

use crate::config::is_url_safe;
use crate::error::PathError;
use crate::rtsp::sdp::Track;
use crate::rtsp::stream::SharedStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-path configuration supplied by the monitor that owns it
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    pub monitor_id: String,
}

/// Addresses of a registered path, handed back to the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPath {
    pub hls_address: String,
    pub rtsp_address: String,
    pub rtsp_protocol: String,
}

/// Observer notified when a path gains or loses its source. Implemented by
/// the HLS server, which creates and destroys muxers accordingly.
pub trait SourceObserver: Send + Sync {
    fn source_ready(&self, path_name: &str, stream: Arc<SharedStream>);
    fn source_not_ready(&self, path_name: &str);
}

/// No-op observer for tests
pub struct NullObserver;

impl SourceObserver for NullObserver {
    fn source_ready(&self, _: &str, _: Arc<SharedStream>) {}
    fn source_not_ready(&self, _: &str) {}
}

#[derive(Debug, Default)]
struct PathState {
    /// Session id of the publisher that reserved this path
    source_id: Option<String>,
    /// Live stream, present while the source is publishing
    stream: Option<Arc<SharedStream>>,
}

#[derive(Debug)]
pub struct Path {
    pub name: String,
    pub config: PathConfig,
    state: Mutex<PathState>,
}

impl Path {
    fn new(name: String, config: PathConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(PathState::default()),
        }
    }

    /// The live stream, or `NoOnePublishing`
    pub fn stream(&self) -> Result<Arc<SharedStream>, PathError> {
        self.state
            .lock()
            .stream
            .clone()
            .ok_or(PathError::NoOnePublishing)
    }

    fn close(&self) {
        let stream = {
            let mut state = self.state.lock();
            state.source_id = None;
            state.stream.take()
        };
        if let Some(stream) = stream {
            stream.close();
        }
    }
}

/// The registry. All operations are linearizable under one mutex; the
/// mutex is never held across a call that could reenter the manager.
pub struct PathManager {
    host: String,
    rtsp_port: u16,
    hls_port: u16,
    observer: Arc<dyn SourceObserver>,
    paths: Mutex<HashMap<String, Arc<Path>>>,
}

impl PathManager {
    pub fn new(
        host: &str,
        rtsp_port: u16,
        hls_port: u16,
        observer: Arc<dyn SourceObserver>,
    ) -> Self {
        Self {
            host: host.to_string(),
            rtsp_port,
            hls_port,
            observer,
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Register a path. The token governs its lifetime: when cancelled the
    /// path is unregistered, its readers and publisher are terminated and
    /// its muxer is dropped.
    pub fn add_path(
        self: &Arc<Self>,
        token: CancellationToken,
        name: &str,
        config: PathConfig,
    ) -> Result<ServerPath, PathError> {
        if !is_url_safe(name) {
            return Err(PathError::InvalidName(name.to_string()));
        }

        {
            let mut paths = self.paths.lock();
            if paths.contains_key(name) {
                return Err(PathError::AlreadyExist);
            }
            paths.insert(
                name.to_string(),
                Arc::new(Path::new(name.to_string(), config)),
            );
        }
        info!(path = name, "path registered");

        let manager = Arc::clone(self);
        let path_name = name.to_string();
        tokio::spawn(async move {
            token.cancelled().await;

            // Snapshot and unregister under the lock, close outside it.
            let removed = manager.paths.lock().remove(&path_name);
            if let Some(path) = removed {
                manager.observer.source_not_ready(&path_name);
                path.close();
                debug!(path = %path_name, "path removed");
            }
        });

        Ok(ServerPath {
            hls_address: format!(
                "http://{}:{}/hls/{}/index.m3u8",
                self.host, self.hls_port, name
            ),
            rtsp_address: format!("rtsp://{}:{}/{}", self.host, self.rtsp_port, name),
            rtsp_protocol: "tcp".to_string(),
        })
    }

    pub fn path_exist(&self, name: &str) -> bool {
        self.paths.lock().contains_key(name)
    }

    /// Called by reader sessions on DESCRIBE
    pub fn on_describe(&self, name: &str) -> Result<Arc<SharedStream>, PathError> {
        let path = self.get(name)?;
        path.stream()
    }

    /// Reserve the publisher slot of a path for a session
    pub fn publisher_add(&self, name: &str, session_id: &str) -> Result<Arc<Path>, PathError> {
        let path = self.get(name)?;
        {
            let mut state = path.state.lock();
            if state.source_id.is_some() {
                return Err(PathError::PublisherExist);
            }
            state.source_id = Some(session_id.to_string());
        }
        debug!(path = name, session_id, "publisher reserved");
        Ok(path)
    }

    /// Publisher transitions to Recording: the stream goes live and the
    /// observer is told so HLS can start muxing.
    pub fn publisher_start(
        &self,
        name: &str,
        session_id: &str,
        tracks: Vec<Track>,
    ) -> Result<Arc<SharedStream>, PathError> {
        let path = self.get(name)?;
        let stream = {
            let mut state = path.state.lock();
            if state.source_id.as_deref() != Some(session_id) {
                return Err(PathError::NoOnePublishing);
            }
            let stream = Arc::new(SharedStream::new(tracks));
            state.stream = Some(Arc::clone(&stream));
            stream
        };

        self.observer.source_ready(name, Arc::clone(&stream));
        info!(path = name, "source ready");
        Ok(stream)
    }

    /// Detach a publisher. A no-op when another session holds the slot.
    pub fn publisher_remove(&self, name: &str, session_id: &str) {
        let Ok(path) = self.get(name) else {
            return;
        };

        let stream = {
            let mut state = path.state.lock();
            if state.source_id.as_deref() != Some(session_id) {
                return;
            }
            state.source_id = None;
            state.stream.take()
        };

        if let Some(stream) = stream {
            self.observer.source_not_ready(name);
            stream.close();
            info!(path = name, "source not ready");
        }
    }

    /// Called by reader sessions on SETUP; the returned stream is where
    /// the session registers itself.
    pub fn reader_add(&self, name: &str, _session_id: &str) -> Result<Arc<SharedStream>, PathError> {
        let path = self.get(name)?;
        path.stream()
    }

    fn get(&self, name: &str) -> Result<Arc<Path>, PathError> {
        self.paths.lock().get(name).cloned().ok_or(PathError::NotExist)
    }
}
