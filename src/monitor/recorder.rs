//! Event-triggered recording.
//!
//! The recorder consumes a monitor's trigger channel. The first event
//! starts a transcoder writing the local RTSP path to disk as an HLS
//! recording; further events inside the window push the stop deadline
//! back instead of starting another recording. The pre-roll comes from
//! the already-buffered live window the transcoder joins at, and the
//! recording's start timestamp is aligned to the nearest keyframe by
//! watching the on-disk playlist.

use crate::error::{MonitorError, NvrError};
use crate::events::{Event, TriggerReceiver};
use crate::hls::playlist;
use crate::process::{self, Process};
use chrono::{DateTime, SecondsFormat, Utc};
use notify::Watcher;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on waiting for the recording's first keyframe
pub const KEYFRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub monitor_id: String,
    /// Local RTSP address of the monitor's path
    pub rtsp_address: String,
    pub storage_dir: String,
    pub transcoder_bin: String,
    pub log_level: String,
}

/// Metadata written next to each recording
#[derive(Debug, Serialize)]
struct RecordingMeta {
    start: DateTime<Utc>,
    detections: Vec<crate::events::Detection>,
}

pub struct Recorder {
    config: RecorderConfig,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self { config }
    }

    /// Consume trigger events until the token fires
    pub async fn run(self, token: CancellationToken, mut trigger: TriggerReceiver) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = trigger.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if let Err(err) = self.record(&token, &mut trigger, event).await {
                error!(monitor_id = %self.config.monitor_id, %err, "recording failed");
            }
        }
        debug!(monitor_id = %self.config.monitor_id, "recorder stopped");
    }

    /// One recording: runs until the (extensible) deadline passes
    async fn record(
        &self,
        token: &CancellationToken,
        trigger: &mut TriggerReceiver,
        first: Event,
    ) -> Result<(), NvrError> {
        let dir = PathBuf::from(&self.config.storage_dir).join(&self.config.monitor_id);
        std::fs::create_dir_all(&dir).map_err(NvrError::Io)?;

        let base = first
            .time
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .replace(':', "-");
        let playlist_path = dir.join(format!("{}.m3u8", base));

        let process = Process::new(
            &self.config.transcoder_bin,
            self.recording_args(&playlist_path),
        )
        .with_prefix(&format!("{}: recorder: ", self.config.monitor_id));

        let process_token = token.child_token();
        let mut deadline = deadline_for(&first);
        info!(
            monitor_id = %self.config.monitor_id,
            until = %deadline,
            "recording started"
        );

        let run = {
            let process_token = process_token.clone();
            tokio::spawn(async move { process.run(&process_token).await })
        };

        // Align the recording start with the first keyframe the
        // transcoder writes.
        match wait_for_keyframe(token, &playlist_path, KEYFRAME_WAIT_TIMEOUT).await {
            Ok(keyframe) => {
                let start = first.time
                    - chrono::Duration::from_std(first.duration + keyframe)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                self.write_meta(&dir.join(format!("{}.json", base)), start, &first);
            }
            Err(err) => warn!(monitor_id = %self.config.monitor_id, %err, "keyframe wait failed"),
        }

        loop {
            let now = Utc::now();
            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(remaining) => break,
                event = trigger.recv() => {
                    let Some(event) = event else { break };
                    let extended = deadline_for(&event);
                    if extended > deadline {
                        debug!(monitor_id = %self.config.monitor_id, until = %extended, "recording extended");
                        deadline = extended;
                    }
                }
            }
        }

        process_token.cancel();
        match run.await {
            Ok(result) => result.map_err(NvrError::Process)?,
            Err(_) => return Err(NvrError::system("recording task panicked")),
        }
        info!(monitor_id = %self.config.monitor_id, "recording finished");
        Ok(())
    }

    fn recording_args(&self, playlist_path: &Path) -> Vec<String> {
        let mut args = process::parse_args(&format!(
            "-y -loglevel {} -rtsp_transport tcp -i {}",
            self.config.log_level, self.config.rtsp_address
        ));
        args.extend(process::parse_args(
            "-c:v copy -c:a copy -f hls -hls_time 2 -hls_list_size 0",
        ));
        args.push(playlist_path.to_string_lossy().into_owned());
        args
    }

    fn write_meta(&self, path: &Path, start: DateTime<Utc>, event: &Event) {
        let meta = RecordingMeta {
            start,
            detections: event.detections.clone(),
        };
        match serde_json::to_vec_pretty(&meta) {
            Ok(raw) => {
                if let Err(err) = std::fs::write(path, raw) {
                    warn!(monitor_id = %self.config.monitor_id, %err, "could not write metadata");
                }
            }
            Err(err) => warn!(monitor_id = %self.config.monitor_id, %err, "could not encode metadata"),
        }
    }
}

/// Stop deadline an event asks for
fn deadline_for(event: &Event) -> DateTime<Utc> {
    event.time
        + chrono::Duration::from_std(event.rec_duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Wait for the playlist to gain a new keyframe line and return its
/// duration. Cancellation yields zero, silence for `timeout` is an error.
pub async fn wait_for_keyframe(
    token: &CancellationToken,
    playlist_path: &Path,
    timeout: Duration,
) -> Result<Duration, NvrError> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Result<notify::Event>>(16);

    let mut watcher = notify::recommended_watcher(move |result| {
        let _ = tx.try_send(result);
    })
    .map_err(|err| NvrError::system(format!("watcher: {}", err)))?;

    // The transcoder may not have created the file yet; watch the parent
    // directory in that case.
    let watch_target = if playlist_path.exists() {
        playlist_path.to_path_buf()
    } else {
        playlist_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| playlist_path.to_path_buf())
    };
    watcher
        .watch(&watch_target, notify::RecursiveMode::NonRecursive)
        .map_err(|err| NvrError::system(format!("watch {}: {}", watch_target.display(), err)))?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(Duration::ZERO),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(MonitorError::KeyframeTimeout(timeout).into());
            }
            event = rx.recv() => {
                match event {
                    Some(Ok(_)) => {
                        let raw = match std::fs::read_to_string(playlist_path) {
                            Ok(raw) => raw,
                            // Not written yet, keep waiting.
                            Err(_) => continue,
                        };
                        match playlist::keyframe_duration(&raw) {
                            Ok(duration) => return Ok(duration),
                            Err(_) => continue,
                        }
                    }
                    Some(Err(err)) => {
                        return Err(NvrError::system(format!("watcher: {}", err)));
                    }
                    None => return Err(NvrError::system("watcher channel closed")),
                }
            }
        }
    }
}
