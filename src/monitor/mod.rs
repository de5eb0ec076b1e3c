//! Per-camera orchestration.
//!
//! A monitor owns everything one camera needs: a registered path (plus a
//! `<id>_sub` path for the low-resolution input), an input process that
//! republishes the camera onto the local RTSP server, an event-driven
//! recorder and, when enabled, the detection bridge. All of it hangs off
//! one cancellation token per monitor, so reconfigure and shutdown are
//! the same operation.

pub mod recorder;

use crate::config::{DetectorSize, EnvConfig, MonitorConfig, NvrConfig};
use crate::detector::{self, DetectionBridge};
use crate::error::{MonitorError, NvrError, Result};
use crate::events::trigger_channel;
use crate::path::{PathConfig, PathManager, ServerPath};
use crate::process::{self, Process};
use parking_lot::Mutex;
use recorder::{Recorder, RecorderConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything a start hook may inspect
pub struct MonitorInfo<'a> {
    pub id: &'a str,
    pub config: &'a MonitorConfig,
    pub env: &'a EnvConfig,
}

/// A start hook appends argv text to an input process command line.
/// Hooks run synchronously in registration order; their fragments
/// concatenate.
pub type ArgsHook = Box<dyn Fn(&MonitorInfo, &mut String) + Send + Sync>;

/// Hook registry, built once at startup and passed to the manager.
#[derive(Default)]
pub struct MonitorHooks {
    main_input: Vec<ArgsHook>,
    sub_input: Vec<ArgsHook>,
}

impl MonitorHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks wired for the built-in detection bridge: the input feeding
    /// the detector gets a FIFO copy of its stream.
    pub fn with_detector() -> Self {
        let mut hooks = Self::new();
        hooks.on_main_input(|info, args| {
            if info.config.detection.enable && info.config.sub_input.is_none() {
                args.push_str(&detector::pipe_args(&info.env.shm_dir, info.id));
            }
        });
        hooks.on_sub_input(|info, args| {
            if info.config.detection.enable && info.config.sub_input.is_some() {
                args.push_str(&detector::pipe_args(&info.env.shm_dir, info.id));
            }
        });
        hooks
    }

    pub fn on_main_input<F>(&mut self, hook: F)
    where
        F: Fn(&MonitorInfo, &mut String) + Send + Sync + 'static,
    {
        self.main_input.push(Box::new(hook));
    }

    pub fn on_sub_input<F>(&mut self, hook: F)
    where
        F: Fn(&MonitorInfo, &mut String) + Send + Sync + 'static,
    {
        self.sub_input.push(Box::new(hook));
    }

    fn main_args(&self, info: &MonitorInfo) -> String {
        let mut args = String::new();
        for hook in &self.main_input {
            hook(info, &mut args);
        }
        args
    }

    fn sub_args(&self, info: &MonitorInfo) -> String {
        let mut args = String::new();
        for hook in &self.sub_input {
            hook(info, &mut args);
        }
        args
    }
}

pub struct MonitorManager {
    paths: Arc<PathManager>,
    env: EnvConfig,
    detectors: HashMap<String, DetectorSize>,
    hooks: MonitorHooks,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl MonitorManager {
    pub fn new(
        paths: Arc<PathManager>,
        env: EnvConfig,
        detectors: HashMap<String, DetectorSize>,
        hooks: MonitorHooks,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            env,
            detectors,
            hooks,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Start every enabled monitor. A monitor that fails to start is
    /// logged and skipped; its peers are unaffected.
    pub async fn start_all(self: &Arc<Self>, parent: &CancellationToken, config: &NvrConfig) {
        for (id, monitor) in &config.monitors {
            if let Err(err) = self.start_monitor(parent, id, monitor.clone()).await {
                error!(monitor_id = %id, %err, "monitor not started");
            }
        }
    }

    /// Start one monitor under a child of `parent`.
    ///
    /// Fatal configuration problems (unknown size that cannot be probed,
    /// bad detection settings) fail the start; nothing is left running.
    pub async fn start_monitor(
        self: &Arc<Self>,
        parent: &CancellationToken,
        id: &str,
        mut config: MonitorConfig,
    ) -> Result<()> {
        if !config.enable {
            info!(monitor_id = %id, "monitor disabled");
            return Ok(());
        }

        {
            let running = self.running.lock();
            if running.contains_key(id) {
                return Err(MonitorError::AlreadyRunning(id.to_string()).into());
            }
        }

        self.probe_sizes(id, &mut config).await?;

        let token = parent.child_token();
        let result = self.start_monitor_inner(&token, id, &config).await;
        match result {
            Ok(()) => {
                self.running.lock().insert(id.to_string(), token.clone());

                // Unregister once the monitor winds down.
                let manager = Arc::clone(self);
                let monitor_id = id.to_string();
                tokio::spawn(async move {
                    token.cancelled().await;
                    manager.running.lock().remove(&monitor_id);
                });

                info!(monitor_id = %id, "monitor started");
                Ok(())
            }
            Err(err) => {
                token.cancel();
                Err(err)
            }
        }
    }

    async fn start_monitor_inner(
        &self,
        token: &CancellationToken,
        id: &str,
        config: &MonitorConfig,
    ) -> Result<()> {
        let main_path = self
            .paths
            .add_path(token.clone(), id, PathConfig {
                monitor_id: id.to_string(),
            })
            .map_err(NvrError::Path)?;

        let sub_path = if config.sub_input.is_some() {
            let name = format!("{}_sub", id);
            Some(
                self.paths
                    .add_path(token.clone(), &name, PathConfig {
                        monitor_id: id.to_string(),
                    })
                    .map_err(NvrError::Path)?,
            )
        } else {
            None
        };

        // Recorder consumes the trigger channel.
        let (trigger, trigger_rx) = trigger_channel();
        let recorder = Recorder::new(RecorderConfig {
            monitor_id: id.to_string(),
            rtsp_address: main_path.rtsp_address.clone(),
            storage_dir: self.env.storage_dir.clone(),
            transcoder_bin: self.env.transcoder_bin.clone(),
            log_level: config.log_level.clone(),
        });
        tokio::spawn(recorder.run(token.child_token(), trigger_rx));

        let info = MonitorInfo {
            id,
            config,
            env: &self.env,
        };

        // Main input: camera -> local path, plus hook fragments.
        let main_process = Process::new(
            &self.env.transcoder_bin,
            input_args(
                config,
                &config.main_input,
                &main_path,
                &self.hooks.main_args(&info),
            ),
        )
        .with_prefix(&format!("{}: main input: ", id));
        tokio::spawn(process::restart_loop(
            token.child_token(),
            main_process,
            format!("{}: main input", id),
        ));

        if let (Some(sub_input), Some(sub_path)) = (&config.sub_input, &sub_path) {
            let sub_process = Process::new(
                &self.env.transcoder_bin,
                input_args(config, sub_input, sub_path, &self.hooks.sub_args(&info)),
            )
            .with_prefix(&format!("{}: sub input: ", id));
            tokio::spawn(process::restart_loop(
                token.child_token(),
                sub_process,
                format!("{}: sub input", id),
            ));
        }

        if config.detection.enable {
            let bridge =
                DetectionBridge::new(id, config, &self.detectors, &self.env, trigger.clone())?;
            tokio::spawn(bridge.run(token.child_token()));
        }

        Ok(())
    }

    /// Probe missing input sizes from the streams. Failure is fatal for
    /// the monitor.
    async fn probe_sizes(&self, id: &str, config: &mut MonitorConfig) -> Result<()> {
        if config.size_main.is_empty() {
            config.size_main =
                process::size_from_stream(&self.env.transcoder_bin, &config.main_input).await?;
            info!(monitor_id = %id, size = %config.size_main, "probed main input size");
        }
        if let Some(sub_input) = &config.sub_input {
            if config.size_sub.is_empty() {
                config.size_sub =
                    process::size_from_stream(&self.env.transcoder_bin, sub_input).await?;
                info!(monitor_id = %id, size = %config.size_sub, "probed sub input size");
            }
        }
        Ok(())
    }

    /// Cancel one monitor. Returns whether it was running.
    pub fn stop_monitor(&self, id: &str) -> bool {
        let token = self.running.lock().remove(id);
        match token {
            Some(token) => {
                token.cancel();
                info!(monitor_id = %id, "monitor stopped");
                true
            }
            None => false,
        }
    }

    /// Restart a monitor with new configuration
    pub async fn reconfigure(
        self: &Arc<Self>,
        parent: &CancellationToken,
        id: &str,
        config: MonitorConfig,
    ) -> Result<()> {
        if self.stop_monitor(id) {
            // Let the old monitor's paths unregister before reusing them.
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        self.start_monitor(parent, id, config).await
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.lock().contains_key(id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }
}

/// Transcoder argv for one input process: pull the camera, republish on
/// the local path, then whatever the hooks appended (e.g. the detector's
/// FIFO output).
fn input_args(
    config: &MonitorConfig,
    input_url: &str,
    path: &ServerPath,
    hook_args: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".to_string()];
    args.push("-loglevel".to_string());
    args.push(config.log_level.clone());
    if !config.hwaccel.is_empty() {
        args.extend(process::parse_args(&format!("-hwaccel {}", config.hwaccel)));
    }
    if input_url.starts_with("rtsp://") {
        args.extend(process::parse_args("-rtsp_transport tcp"));
    }
    args.push("-i".to_string());
    args.push(input_url.to_string());
    args.extend(process::parse_args("-c:v copy -c:a copy -f rtsp -rtsp_transport tcp"));
    args.push(path.rtsp_address.clone());
    args.extend(process::parse_args(hook_args));
    args
}
