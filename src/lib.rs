pub mod app;
pub mod auth;
pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod hls;
pub mod monitor;
pub mod path;
pub mod process;
pub mod rtsp;

pub use app::NvrApp;
pub use auth::{Account, AccountStore, AllowAll, AuthDecision, Authenticator, StoreAuthenticator};
pub use config::{MonitorConfig, NvrConfig};
pub use detector::DetectionBridge;
pub use error::{NvrError, Result};
pub use events::{Detection, Event, Region, RegionRect, Trigger};
pub use hls::muxer::{HlsMuxer, MuxerConfig};
pub use hls::HlsServer;
pub use monitor::{MonitorHooks, MonitorManager};
pub use path::{PathConfig, PathManager, ServerPath, SourceObserver};
pub use process::Process;
pub use rtsp::stream::SharedStream;
pub use rtsp::RtspServer;
