use std::time::Duration;
use thiserror::Error;

/// Main error type for the NVR system
#[derive(Error, Debug)]
pub enum NvrError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("RTSP error: {0}")]
    Rtsp(#[from] RtspError),

    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("HLS error: {0}")]
    Hls(#[from] HlsError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Graceful shutdown requested")]
    Shutdown,
}

/// RTSP protocol and session error types
#[derive(Error, Debug)]
pub enum RtspError {
    #[error("Malformed request: {details}")]
    Parse { details: String },

    #[error("Malformed SDP: {details}")]
    Sdp { details: String },

    #[error("Malformed RTP packet: {details}")]
    Rtp { details: String },

    #[error("Method {method} not valid in state {state}")]
    InvalidState { method: String, state: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Transport header rejected: {details}")]
    Transport { details: String },

    #[error("Interleaved channel {channel} not bound to a track")]
    UnknownChannel { channel: u8 },

    #[error("Track {0} out of range")]
    TrackOutOfRange(usize),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Reader queue overflow, session closed")]
    ReaderOverflow,

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
}

/// Path manager error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path already exist")]
    AlreadyExist,

    #[error("path not exist")]
    NotExist,

    #[error("no one is publishing to path")]
    NoOnePublishing,

    #[error("a publisher is already connected to path")]
    PublisherExist,

    #[error("invalid path name: {0}")]
    InvalidName(String),
}

/// HLS muxer and server error types
#[derive(Error, Debug)]
pub enum HlsError {
    #[error("muxer not found for path: {0}")]
    MuxerNotFound(String),

    #[error("timed out waiting for muxer on path {path} after {timeout:?}")]
    MuxerTimeout { path: String, timeout: Duration },

    #[error("segment {0} not in ring")]
    SegmentNotFound(u64),

    #[error("playlist parse failed: {details}")]
    PlaylistParse { details: String },

    #[error("unsupported payload: {details}")]
    UnsupportedPayload { details: String },
}

/// Subprocess supervisor error types
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("process exited with status {code:?}")]
    Crashed { code: Option<i32> },

    #[error("could not probe stream size: {details}")]
    SizeProbe { details: String },

    #[error("could not create fifo at {path}: {details}")]
    Pipe { path: String, details: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Monitor orchestration error types
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("invalid monitor config for {id}: {details}")]
    Config { id: String, details: String },

    #[error("monitor {0} already running")]
    AlreadyRunning(String),

    #[error("trigger channel closed")]
    TriggerClosed,

    #[error("keyframe wait timed out after {0:?}")]
    KeyframeTimeout(Duration),
}

/// Detection bridge error types
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("unknown detector: {0}")]
    UnknownDetector(String),

    #[error("could not parse thresholds: {details}")]
    Thresholds { details: String },

    #[error("input {input_width}x{input_height} smaller than detector {output_width}x{output_height}")]
    InputTooSmall {
        input_width: u32,
        input_height: u32,
        output_width: u32,
        output_height: u32,
    },

    #[error("could not dial detector at {addr}: {details}")]
    Dial { addr: String, details: String },

    #[error("detector stream error: {details}")]
    Stream { details: String },

    #[error("frame read failed: {0}")]
    FrameRead(std::io::Error),

    #[error("png encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Account store error types
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("users file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("users file corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl NvrError {
    /// Create a system error with a message
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Component name for structured logging
    pub fn component_name(&self) -> &'static str {
        match self {
            NvrError::Rtsp(_) => "rtsp",
            NvrError::Path(_) => "path",
            NvrError::Hls(_) => "hls",
            NvrError::Process(_) => "process",
            NvrError::Monitor(_) => "monitor",
            NvrError::Detector(_) => "detector",
            NvrError::Auth(_) => "auth",
            NvrError::Config(_) => "config",
            _ => "system",
        }
    }

    /// Whether the owning component should retry after this error.
    ///
    /// Fatal configuration errors stop the component; transport and
    /// subprocess failures are retried by their supervisors.
    pub fn is_recoverable(&self) -> bool {
        match self {
            NvrError::Process(ProcessError::Crashed { .. }) => true,
            NvrError::Process(ProcessError::Spawn { .. }) => true,
            NvrError::Detector(DetectorError::Dial { .. }) => true,
            NvrError::Detector(DetectorError::Stream { .. }) => true,
            NvrError::Rtsp(RtspError::Network(_)) => true,
            NvrError::Io(_) => true,
            NvrError::Config(_) => false,
            NvrError::Monitor(MonitorError::Config { .. }) => false,
            NvrError::Shutdown => false,
            _ => false,
        }
    }
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, NvrError>;
