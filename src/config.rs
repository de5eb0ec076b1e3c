use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NvrConfig {
    pub server: ServerConfig,
    pub env: EnvConfig,

    /// Per-camera monitors, keyed by monitor id. The id doubles as the
    /// RTSP path name, so it must be URL-safe.
    #[serde(default)]
    pub monitors: HashMap<String, MonitorConfig>,

    /// Known detectors and their model input sizes, keyed by name
    #[serde(default)]
    pub detectors: HashMap<String, DetectorSize>,
}

/// Model input resolution of one detector
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Host advertised in RTSP and HLS addresses
    #[serde(default = "default_host")]
    pub host: String,

    /// RTSP listener port
    #[serde(default = "default_rtsp_port")]
    pub rtsp_port: u16,

    /// HLS HTTP listener port
    #[serde(default = "default_hls_port")]
    pub hls_port: u16,

    /// Idle RTSP sessions are closed after this many seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Number of segments kept per HLS playlist
    #[serde(default = "default_segment_count")]
    pub hls_segment_count: usize,

    /// Minimum HLS segment duration in milliseconds
    #[serde(default = "default_min_segment_ms")]
    pub hls_min_segment_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EnvConfig {
    /// Shared-memory directory for transcoder FIFOs
    #[serde(default = "default_shm_dir")]
    pub shm_dir: String,

    /// Directory recordings are written to
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// Transcoder binary
    #[serde(default = "default_transcoder_bin")]
    pub transcoder_bin: String,

    /// Address of the object-detection service
    #[serde(default = "default_detector_addr")]
    pub detector_addr: String,

    /// Optional path to the users file backing the request validator
    #[serde(default)]
    pub users_file: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    /// Whether this monitor runs at all
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Camera URL for the main input
    pub main_input: String,

    /// Optional lower-resolution input used by the detector
    #[serde(default)]
    pub sub_input: Option<String>,

    /// Main input size as "WxH". Probed from the stream when empty.
    #[serde(default)]
    pub size_main: String,

    /// Sub input size as "WxH"
    #[serde(default)]
    pub size_sub: String,

    /// Hardware acceleration flags passed to the transcoder
    #[serde(default)]
    pub hwaccel: String,

    /// Transcoder log verbosity
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub detection: DetectionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectionConfig {
    /// Whether detection runs for this monitor
    #[serde(default)]
    pub enable: bool,

    /// Which detector the service should apply
    #[serde(default)]
    pub detector_name: String,

    /// JSON map of label to minimum score; -1 disables the label
    #[serde(default = "default_thresholds")]
    pub thresholds: String,

    /// Frames per second fed to the detector
    #[serde(default = "default_feed_rate")]
    pub feed_rate: f64,

    /// Seconds of recording after an event
    #[serde(default = "default_record_duration")]
    pub record_duration: f64,

    /// Milliseconds subtracted from frame capture time to compensate
    /// for transcoder latency
    #[serde(default)]
    pub timestamp_offset_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enable: false,
            detector_name: String::new(),
            thresholds: default_thresholds(),
            feed_rate: default_feed_rate(),
            record_duration: default_record_duration(),
            timestamp_offset_ms: 0,
        }
    }
}

impl NvrConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("nvr.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.rtsp_port", default_rtsp_port())?
            .set_default("server.hls_port", default_hls_port())?
            .set_default("server.session_timeout_secs", default_session_timeout())?
            .set_default("server.hls_segment_count", default_segment_count() as i64)?
            .set_default("server.hls_min_segment_ms", default_min_segment_ms() as i64)?
            .set_default("env.shm_dir", default_shm_dir())?
            .set_default("env.storage_dir", default_storage_dir())?
            .set_default("env.transcoder_bin", default_transcoder_bin())?
            .set_default("env.detector_addr", default_detector_addr())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("NVR").separator("__"))
            .build()?;

        let config: NvrConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.rtsp_port == self.server.hls_port {
            return Err(ConfigError::Message(
                "RTSP and HLS ports must differ".to_string(),
            ));
        }

        if self.server.hls_segment_count < 2 {
            return Err(ConfigError::Message(
                "hls_segment_count must be at least 2".to_string(),
            ));
        }

        for (id, monitor) in &self.monitors {
            if !is_url_safe(id) {
                return Err(ConfigError::Message(format!(
                    "monitor id {:?} is not URL-safe",
                    id
                )));
            }
            if monitor.main_input.is_empty() {
                return Err(ConfigError::Message(format!(
                    "monitor {:?} has no main_input",
                    id
                )));
            }
            if monitor.detection.enable && monitor.detection.feed_rate <= 0.0 {
                return Err(ConfigError::Message(format!(
                    "monitor {:?}: feed_rate must be positive",
                    id
                )));
            }
        }

        Ok(())
    }
}

/// Path names appear in RTSP and HLS URLs, so only an unreserved subset
/// is accepted.
pub fn is_url_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parse a "WxH" size string
pub fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

impl Default for NvrConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            env: EnvConfig::default(),
            monitors: HashMap::new(),
            detectors: HashMap::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            rtsp_port: default_rtsp_port(),
            hls_port: default_hls_port(),
            session_timeout_secs: default_session_timeout(),
            hls_segment_count: default_segment_count(),
            hls_min_segment_ms: default_min_segment_ms(),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            storage_dir: default_storage_dir(),
            transcoder_bin: default_transcoder_bin(),
            detector_addr: default_detector_addr(),
            users_file: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rtsp_port() -> u16 {
    8554
}

fn default_hls_port() -> u16 {
    8888
}

fn default_session_timeout() -> u64 {
    60
}

fn default_segment_count() -> usize {
    5
}

fn default_min_segment_ms() -> u64 {
    1000
}

fn default_shm_dir() -> String {
    "/dev/shm/nvr".to_string()
}

fn default_storage_dir() -> String {
    "storage".to_string()
}

fn default_transcoder_bin() -> String {
    "ffmpeg".to_string()
}

fn default_detector_addr() -> String {
    "127.0.0.1:8089".to_string()
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_thresholds() -> String {
    "{}".to_string()
}

fn default_feed_rate() -> f64 {
    0.5
}

fn default_record_duration() -> f64 {
    120.0
}

fn default_true() -> bool {
    true
}
