//! Detection bridge: raw frames in, recording events out.
//!
//! A second transcoder reads the monitor's FIFO and emits raw RGB24
//! frames at the detector's input resolution, scaled with the aspect
//! ratio preserved and letterbox-padded at the origin. Each frame is
//! PNG-encoded and streamed to the detection service; surviving
//! detections become trigger events for the monitor's recorder.
//!
//! Frames are processed strictly one at a time. When the detector is
//! slower than the feed rate the OS pipe buffer fills and the transcoder
//! blocks, which is the intended rate control.

pub mod client;

use crate::config::{DetectionConfig, DetectorSize, EnvConfig, MonitorConfig};
use crate::error::{DetectorError, NvrError};
use crate::events::{Detection, Event, Region, RegionRect, Trigger};
use crate::process::{self, Process};
use client::{DetectRequest, DetectorClient, RawDetection};
use chrono::Utc;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Forwarded to the service so every label above 10% comes back; the
/// bridge applies the real per-label thresholds itself
const DETECT_ALL_SCORE: f64 = 10.0;

/// Parsed detection settings for one monitor
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub detector_name: String,
    /// Per-label minimum scores; disabled labels are already removed
    pub thresholds: HashMap<String, f64>,
    /// Pre-roll attached to events, one frame interval at the feed rate
    pub duration: Duration,
    pub rec_duration: Duration,
    pub timestamp_offset: Duration,
}

impl BridgeConfig {
    pub fn parse(config: &DetectionConfig) -> Result<Self, DetectorError> {
        let mut thresholds: HashMap<String, f64> = serde_json::from_str(&config.thresholds)
            .map_err(|err| DetectorError::Thresholds {
                details: err.to_string(),
            })?;
        thresholds.retain(|_, threshold| *threshold != -1.0);

        let duration = process::feed_rate_to_duration(config.feed_rate).map_err(|_| {
            DetectorError::Thresholds {
                details: format!("invalid feed rate: {}", config.feed_rate),
            }
        })?;

        Ok(Self {
            detector_name: config.detector_name.clone(),
            thresholds,
            duration,
            rec_duration: Duration::from_secs_f64(config.record_duration.max(0.0)),
            timestamp_offset: Duration::from_millis(config.timestamp_offset_ms),
        })
    }
}

/// Argv fragment a start hook appends to the monitor's input process so
/// the bridge gets a copy of the stream through a FIFO
pub fn pipe_args(shm_dir: &str, monitor_id: &str) -> String {
    format!(
        " -c:v copy -map 0:v -f fifo -fifo_format mpegts \
         -drop_pkts_on_overflow 1 -attempt_recovery 1 \
         -restart_with_keyframe 1 -recovery_wait_time 1 {}/detector/{}/main.fifo",
        shm_dir, monitor_id
    )
}

pub struct DetectionBridge {
    monitor_id: String,
    config: BridgeConfig,
    trigger: Trigger,

    output_width: u32,
    output_height: u32,
    x_multiplier: f64,
    y_multiplier: f64,

    transcoder_bin: String,
    detector_addr: String,
    shm_dir: String,
    args: Vec<String>,
}

impl DetectionBridge {
    pub fn new(
        monitor_id: &str,
        monitor: &MonitorConfig,
        detectors: &HashMap<String, DetectorSize>,
        env: &EnvConfig,
        trigger: Trigger,
    ) -> Result<Arc<Self>, NvrError> {
        let config = BridgeConfig::parse(&monitor.detection)?;

        let detector = detectors
            .get(&config.detector_name)
            .copied()
            .ok_or_else(|| DetectorError::UnknownDetector(config.detector_name.clone()))?;

        let size = if monitor.sub_input.is_some() {
            &monitor.size_sub
        } else {
            &monitor.size_main
        };

        let mut bridge = Self {
            monitor_id: monitor_id.to_string(),
            config,
            trigger,
            output_width: detector.width,
            output_height: detector.height,
            x_multiplier: 1.0,
            y_multiplier: 1.0,
            transcoder_bin: env.transcoder_bin.clone(),
            detector_addr: env.detector_addr.clone(),
            shm_dir: env.shm_dir.clone(),
            args: Vec::new(),
        };

        let (args, x_multiplier, y_multiplier) = bridge.generate_transcoder_args(monitor, size)?;
        bridge.args = args;
        bridge.x_multiplier = x_multiplier;
        bridge.y_multiplier = y_multiplier;

        Ok(Arc::new(bridge))
    }

    fn fifo_dir(&self) -> PathBuf {
        PathBuf::from(&self.shm_dir)
            .join("detector")
            .join(&self.monitor_id)
    }

    fn main_pipe(&self) -> PathBuf {
        self.fifo_dir().join("main.fifo")
    }

    /// Transcoder argv for the raw-frame process, plus the inverse
    /// mapping from detector space back to monitor space.
    ///
    /// The shorter input axis is scaled to fit the detector size and the
    /// remainder padded at origin (0,0):
    ///
    /// `-y -loglevel error -i main.fifo -filter
    ///  fps=fps=2,scale=300:168,pad=300:300:0:0 -f rawvideo -pix_fmt rgb24 -`
    fn generate_transcoder_args(
        &self,
        monitor: &MonitorConfig,
        size: &str,
    ) -> Result<(Vec<String>, f64, f64), DetectorError> {
        let (input_width, input_height) =
            crate::config::parse_size(size).ok_or_else(|| DetectorError::Thresholds {
                details: format!("bad input size: {:?}", size),
            })?;

        if input_width < self.output_width || input_height < self.output_height {
            return Err(DetectorError::InputTooSmall {
                input_width,
                input_height,
                output_width: self.output_width,
                output_height: self.output_height,
            });
        }

        let output_width = self.output_width as f64;
        let output_height = self.output_height as f64;
        let input_width = input_width as f64;
        let input_height = input_height as f64;

        let mut frame_width = output_width;
        let mut frame_height = output_height;
        let mut x_multiplier = 1.0;
        let mut y_multiplier = 1.0;

        if input_width > input_height {
            frame_height = (output_height * input_height / input_width).trunc();
            y_multiplier = output_height / frame_height;
        } else if input_width < input_height {
            frame_width = (output_width * input_width / input_height).trunc();
            x_multiplier = output_width / frame_width;
        }

        let mut args: Vec<String> = vec!["-y".to_string()];
        args.push("-loglevel".to_string());
        args.push(monitor.log_level.clone());
        if !monitor.hwaccel.is_empty() {
            args.extend(process::parse_args(&format!("-hwaccel {}", monitor.hwaccel)));
        }
        args.push("-i".to_string());
        args.push(self.main_pipe().to_string_lossy().into_owned());
        args.push("-filter".to_string());
        args.push(format!(
            "fps=fps={},scale={}:{},pad={}:{}:0:0",
            monitor.detection.feed_rate,
            frame_width as u32,
            frame_height as u32,
            self.output_width,
            self.output_height,
        ));
        args.push("-f".to_string());
        args.push("rawvideo".to_string());
        args.push("-pix_fmt".to_string());
        args.push("rgb24".to_string());
        args.push("-".to_string());

        Ok((args, x_multiplier, y_multiplier))
    }

    fn prepare_environment(&self) -> Result<(), NvrError> {
        std::fs::create_dir_all(self.fifo_dir()).map_err(NvrError::Io)?;
        process::make_pipe(self.main_pipe())?;
        Ok(())
    }

    /// Run until the token fires, restarting the transcoder on crashes
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        if let Err(err) = self.prepare_environment() {
            error!(monitor_id = %self.monitor_id, %err, "detector: could not prepare environment");
            return;
        }

        loop {
            if token.is_cancelled() {
                info!(monitor_id = %self.monitor_id, "detector: process stopped");
                return;
            }
            if let Err(err) = self.run_once(&token).await {
                error!(monitor_id = %self.monitor_id, %err, "detector: process crashed");
                tokio::time::sleep(process::CRASH_BACKOFF).await;
            }
        }
    }

    async fn run_once(self: &Arc<Self>, token: &CancellationToken) -> Result<(), NvrError> {
        let mut process = Process::new(&self.transcoder_bin, self.args.clone())
            .with_prefix(&format!("{}: detector: process: ", self.monitor_id))
            .spawn()?;

        let Some(stdout) = process.take_stdout() else {
            return Err(NvrError::system("transcoder stdout not piped"));
        };
        process.forward_output();

        let client_token = token.child_token();
        let client_task = {
            let bridge = Arc::clone(self);
            let token = client_token.clone();
            tokio::spawn(async move { bridge.client_loop(token, stdout).await })
        };

        info!(monitor_id = %self.monitor_id, "detector: starting process");
        let result = process.wait(token).await;

        client_token.cancel();
        let _ = client_task.await;
        result.map_err(NvrError::Process)
    }

    /// Reconnect loop around the streaming client
    async fn client_loop(self: Arc<Self>, token: CancellationToken, mut stdout: ChildStdout) {
        loop {
            if token.is_cancelled() {
                debug!(monitor_id = %self.monitor_id, "detector: client stopped");
                return;
            }
            match self.run_client(&token, &mut stdout).await {
                // Clean end of the frame stream
                Ok(()) => return,
                Err(err) => {
                    error!(monitor_id = %self.monitor_id, %err, "detector: client crashed");
                    tokio::time::sleep(process::CRASH_BACKOFF).await;
                }
            }
        }
    }

    async fn run_client(
        &self,
        token: &CancellationToken,
        stdout: &mut ChildStdout,
    ) -> Result<(), NvrError> {
        let mut client = DetectorClient::connect(&self.detector_addr).await?;
        self.read_frames(token, stdout, &mut client).await
    }

    /// One frame at a time: read, encode, detect, filter, trigger
    async fn read_frames(
        &self,
        token: &CancellationToken,
        stdout: &mut ChildStdout,
        client: &mut DetectorClient,
    ) -> Result<(), NvrError> {
        let frame_size = (self.output_width * self.output_height * 3) as usize;
        let mut frame = vec![0u8; frame_size];

        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            match stdout.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(DetectorError::FrameRead(err).into()),
            }

            let time = Utc::now()
                - chrono::Duration::from_std(self.config.timestamp_offset)
                    .unwrap_or_else(|_| chrono::Duration::zero());

            let mut png = Vec::new();
            PngEncoder::new_with_quality(&mut png, CompressionType::Fast, FilterType::NoFilter)
                .write_image(
                    &frame,
                    self.output_width,
                    self.output_height,
                    ExtendedColorType::Rgb8,
                )
                .map_err(DetectorError::Encode)?;

            let response = client
                .detect(&DetectRequest {
                    detector_name: self.config.detector_name.clone(),
                    data: png,
                    detect: HashMap::from([("*".to_string(), DETECT_ALL_SCORE)]),
                })
                .await?;

            let detections = self.parse_detections(&response.detections);
            if !detections.is_empty() {
                info!(
                    monitor_id = %self.monitor_id,
                    label = %detections[0].label,
                    score = detections[0].score,
                    "detector: trigger"
                );
                if self
                    .trigger
                    .send(Event {
                        time,
                        detections,
                        duration: self.config.duration,
                        rec_duration: self.config.rec_duration,
                    })
                    .await
                    .is_err()
                {
                    // Monitor is gone, stop feeding frames.
                    return Ok(());
                }
            }
        }
    }

    /// Apply per-label thresholds and convert detector-space coordinates
    /// (0..1 of the padded frame) into monitor-space percent units
    /// (0..10000).
    fn parse_detections(&self, raw: &[RawDetection]) -> Vec<Detection> {
        let convert = |value: f64| (value * 10_000.0) as i32;

        raw.iter()
            .filter(|detection| {
                self.config
                    .thresholds
                    .get(&detection.label)
                    .is_some_and(|threshold| detection.confidence >= *threshold)
            })
            .map(|detection| Detection {
                label: detection.label.clone(),
                score: detection.confidence,
                region: Region {
                    rect: RegionRect {
                        top: convert(detection.top * self.y_multiplier),
                        left: convert(detection.left * self.x_multiplier),
                        bottom: convert(detection.bottom * self.y_multiplier),
                        right: convert(detection.right * self.x_multiplier),
                    },
                },
            })
            .collect()
    }
}
