//! Transcoder subprocess supervision.
//!
//! A [`Process`] runs one child under a cancellation token: on cancel it
//! sends SIGINT, waits out a grace period and escalates to SIGKILL. The
//! transcoder exits with status 255 on a normal stop, which is treated as
//! success. Restarting after crashes is the caller's outer loop
//! ([`restart_loop`]), never recursion.

use crate::error::ProcessError;
use std::ffi::CString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Exit status the transcoder returns on a routine stop
const TRANSCODER_CLEAN_EXIT: i32 = 255;

/// Restart delay after a crash
pub const CRASH_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Process {
    program: String,
    args: Vec<String>,
    stop_timeout: Duration,
    prefix: String,
}

impl Process {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            prefix: String::new(),
        }
    }

    /// Grace period between SIGINT and SIGKILL
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Prefix for forwarded child output lines
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Spawn the child with piped output
    pub fn spawn(&self) -> Result<RunningProcess, ProcessError> {
        debug!(program = %self.program, args = ?self.args, "spawning");
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Ok(RunningProcess {
            child,
            stop_timeout: self.stop_timeout,
            prefix: self.prefix.clone(),
        })
    }

    /// Run the child to completion, line-scanning both pipes into the log.
    /// Returns when the child exits or, after cancellation, once it has
    /// been stopped.
    pub async fn run(&self, token: &CancellationToken) -> Result<(), ProcessError> {
        let mut process = self.spawn()?;
        process.forward_output();
        process.wait(token).await
    }
}

pub struct RunningProcess {
    child: Child,
    stop_timeout: Duration,
    prefix: String,
}

impl RunningProcess {
    /// Steal stdout, e.g. for the detector's raw-frame reader
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Forward whatever output pipes are still attached to the log
    pub fn forward_output(&mut self) {
        if let Some(stdout) = self.child.stdout.take() {
            spawn_line_scanner(stdout, self.prefix.clone(), "stdout");
        }
        if let Some(stderr) = self.child.stderr.take() {
            spawn_line_scanner(stderr, self.prefix.clone(), "stderr");
        }
    }

    /// Wait for exit; on cancellation stop the child gracefully first
    pub async fn wait(mut self, token: &CancellationToken) -> Result<(), ProcessError> {
        tokio::select! {
            status = self.child.wait() => {
                let status = status?;
                exit_result(status.code())
            }
            _ = token.cancelled() => {
                self.stop().await;
                Ok(())
            }
        }
    }

    /// SIGINT, grace period, SIGKILL. Sending SIGKILL immediately would
    /// rob the transcoder of its chance to flush and unlink its outputs.
    async fn stop(&mut self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: pid is a live child of this process
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }

        match tokio::time::timeout(self.stop_timeout, self.child.wait()).await {
            Ok(_) => debug!("child stopped on SIGINT"),
            Err(_) => {
                warn!("child ignored SIGINT, killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}

fn exit_result(code: Option<i32>) -> Result<(), ProcessError> {
    match code {
        Some(0) | Some(TRANSCODER_CLEAN_EXIT) => Ok(()),
        code => Err(ProcessError::Crashed { code }),
    }
}

fn spawn_line_scanner<R>(pipe: R, prefix: String, label: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("{}{}: {}", prefix, label, line);
        }
    });
}

/// Run a process forever, restarting after crashes, until the token fires
pub async fn restart_loop(token: CancellationToken, process: Process, label: String) {
    loop {
        if token.is_cancelled() {
            info!("{}: process stopped", label);
            return;
        }
        if let Err(err) = process.run(&token).await {
            error!("{}: process crashed: {}", label, err);
            tokio::time::sleep(CRASH_BACKOFF).await;
        }
    }
}

/// Recreate a FIFO with mode 0600
pub fn make_pipe<P: AsRef<Path>>(path: P) -> Result<(), ProcessError> {
    let path = path.as_ref();
    let _ = std::fs::remove_file(path);

    let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
        ProcessError::Pipe {
            path: path.display().to_string(),
            details: "path contains NUL".to_string(),
        }
    })?;

    // SAFETY: c_path is a valid NUL-terminated string
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(ProcessError::Pipe {
            path: path.display().to_string(),
            details: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

/// Split a flag string on whitespace
pub fn parse_args(args: &str) -> Vec<String> {
    args.split_whitespace().map(str::to_string).collect()
}

/// Interval between frames at a given feed rate
pub fn feed_rate_to_duration(rate: f64) -> Result<Duration, ProcessError> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(ProcessError::SizeProbe {
            details: format!("invalid feed rate: {}", rate),
        });
    }
    Ok(Duration::from_secs_f64(1.0 / rate))
}

/// Probe a stream's size by running the transcoder against it with
/// metadata output and scanning stderr for a `WxH` token.
///
/// Best effort: no match fails the caller, there is no retry.
pub async fn size_from_stream(transcoder_bin: &str, url: &str) -> Result<String, ProcessError> {
    let output = Command::new(transcoder_bin)
        .args(["-i", url, "-f", "ffmetadata", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: transcoder_bin.to_string(),
            source,
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    // "Stream #0:0: Video: h264 (Main), yuv420p(progressive), 720x1280, 30 fps"
    find_size(&stderr).ok_or_else(|| ProcessError::SizeProbe {
        details: format!("no size in output: {}", stderr.trim()),
    })
}

fn find_size(text: &str) -> Option<String> {
    for token in text.split(|c: char| !c.is_ascii_alphanumeric()) {
        if let Some((width, height)) = token.split_once('x') {
            if !width.is_empty()
                && !height.is_empty()
                && width.bytes().all(|b| b.is_ascii_digit())
                && height.bytes().all(|b| b.is_ascii_digit())
            {
                return Some(token.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_clean_exit() {
        let token = CancellationToken::new();
        Process::new("sh", parse_args("-c true"))
            .run(&token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exit_255_is_success() {
        let token = CancellationToken::new();
        Process::new("sh", vec!["-c".to_string(), "exit 255".to_string()])
            .run(&token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_crash_reports_code() {
        let token = CancellationToken::new();
        let err = Process::new("sh", vec!["-c".to_string(), "exit 3".to_string()])
            .run(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Crashed { code: Some(3) }));
    }

    #[tokio::test]
    async fn test_graceful_stop_on_cancel() {
        let token = CancellationToken::new();
        let process = Process::new("sleep", vec!["10".to_string()])
            .with_stop_timeout(Duration::from_millis(50));

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        process.run(&token).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sigkill_escalation() {
        let token = CancellationToken::new();
        // Child ignores SIGINT, so the grace period must elapse and
        // SIGKILL must finish it.
        let process = Process::new(
            "sh",
            vec!["-c".to_string(), "trap '' INT; sleep 10".to_string()],
        )
        .with_stop_timeout(Duration::from_millis(50));

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        process.run(&token).await.unwrap();
        // SIGINT sent around 30ms, SIGKILL within ~100ms of that
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let process = Process::new("/nonexistent/transcoder", vec![]);
        assert!(matches!(
            process.spawn(),
            Err(ProcessError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_make_pipe() {
        use std::os::unix::fs::FileTypeExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.fifo");

        make_pipe(&path).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());

        // Recreating over an existing pipe succeeds
        make_pipe(&path).unwrap();
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(
            parse_args(" -hwaccel  cuda "),
            vec!["-hwaccel".to_string(), "cuda".to_string()]
        );
        assert!(parse_args("").is_empty());
    }

    #[test]
    fn test_feed_rate_to_duration() {
        assert_eq!(
            feed_rate_to_duration(2.0).unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(feed_rate_to_duration(0.5).unwrap(), Duration::from_secs(2));
        assert!(feed_rate_to_duration(0.0).is_err());
        assert!(feed_rate_to_duration(-1.0).is_err());
    }

    #[test]
    fn test_find_size() {
        let stderr = "Stream #0:0: Video: h264 (Main), yuv420p(progressive), 720x1280, 30 fps";
        assert_eq!(find_size(stderr), Some("720x1280".to_string()));
        assert_eq!(find_size("no size here"), None);
        // 'h264' must not match
        assert_eq!(find_size("h264 only"), None);
    }

    #[tokio::test]
    async fn test_size_from_stream_no_match() {
        // `sh` here stands in for the transcoder binary
        let err = size_from_stream("sh", "-c").await.unwrap_err();
        assert!(matches!(err, ProcessError::SizeProbe { .. }));
    }
}
