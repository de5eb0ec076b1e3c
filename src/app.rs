//! Top-level wiring: config in, running media plane out.

use crate::auth::{AccountStore, AllowAll, Authenticator, StoreAuthenticator};
use crate::config::NvrConfig;
use crate::error::Result;
use crate::hls::muxer::MuxerConfig;
use crate::hls::HlsServer;
use crate::monitor::{MonitorHooks, MonitorManager};
use crate::path::PathManager;
use crate::rtsp::RtspServer;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct NvrApp {
    config: NvrConfig,
    token: CancellationToken,
    pub hls: Arc<HlsServer>,
    pub paths: Arc<PathManager>,
    pub monitors: Arc<MonitorManager>,
    auth: Arc<dyn Authenticator>,
}

impl NvrApp {
    pub fn new(config: NvrConfig) -> Result<Self> {
        let hls = HlsServer::new(MuxerConfig {
            segment_count: config.server.hls_segment_count,
            min_segment_duration: Duration::from_millis(config.server.hls_min_segment_ms),
        });

        let paths = Arc::new(PathManager::new(
            &config.server.host,
            config.server.rtsp_port,
            config.server.hls_port,
            Arc::clone(&hls) as Arc<dyn crate::path::SourceObserver>,
        ));

        // Hash comparison policy lives with the embedder; the binary
        // compares stored secrets directly.
        let auth: Arc<dyn Authenticator> = match &config.env.users_file {
            Some(users_file) => {
                let store = AccountStore::open(users_file)?;
                Arc::new(StoreAuthenticator::new(store, |hash, password| {
                    hash == password
                }))
            }
            None => Arc::new(AllowAll),
        };

        let monitors = MonitorManager::new(
            Arc::clone(&paths),
            config.env.clone(),
            config.detectors.clone(),
            MonitorHooks::with_detector(),
        );

        Ok(Self {
            config,
            token: CancellationToken::new(),
            hls,
            paths,
            monitors,
            auth,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run until the cancellation token fires, then unwind
    pub async fn run(self) -> Result<()> {
        let rtsp = RtspServer::bind(
            self.config.server.rtsp_port,
            Arc::clone(&self.paths),
            Arc::clone(&self.auth),
            Duration::from_secs(self.config.server.session_timeout_secs),
        )
        .await?;
        let rtsp_task = tokio::spawn(rtsp.run(self.token.child_token()));

        let hls_task = {
            let hls = Arc::clone(&self.hls);
            let port = self.config.server.hls_port;
            let token = self.token.child_token();
            tokio::spawn(async move { hls.run(port, token).await })
        };

        self.monitors.start_all(&self.token, &self.config).await;
        info!(
            monitors = self.monitors.running_count(),
            "NVR media core running"
        );

        self.token.cancelled().await;
        info!("shutting down");

        let _ = rtsp_task.await;
        let _ = hls_task.await;
        info!("shutdown complete");
        Ok(())
    }
}
