//! Plugin execution: spawning plugin processes and recording outcomes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::plugin::{Plugin, RunRecord, RunStatus};
use crate::schedule::Schedule;

/// How long after process exit the output pipes may stay open before
/// the captured output is taken as is.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Spawns plugin processes with the standard environment and captures
/// their output.
///
/// Every failure mode ends up in the returned [`RunRecord`]: spawn
/// errors, timeouts, and non-zero exits are data, not errors.
#[derive(Debug, Clone)]
pub struct PluginRunner {
    plugin_dir: PathBuf,
    run_timeout: Duration,
    max_output_bytes: usize,
}

impl PluginRunner {
    pub fn new(
        plugin_dir: impl Into<PathBuf>,
        run_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            run_timeout,
            max_output_bytes,
        }
    }

    /// Run a plugin to completion and record the outcome.
    ///
    /// The plugin file is executed directly with its own directory as the
    /// working directory. Streamable plugins run without a timeout; the
    /// process is killed when the returned future is dropped.
    pub async fn run(&self, plugin: &Plugin) -> RunRecord {
        let started_at = Utc::now();
        let started = Instant::now();

        debug!(plugin = %plugin.id, path = %plugin.path.display(), "Running plugin");

        let mut command = Command::new(&plugin.path);
        command
            .current_dir(plugin.path.parent().unwrap_or(&self.plugin_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &plugin.metadata.environment {
            command.env(key, value);
        }
        command
            .env("PEGBOARD", "1")
            .env("PEGBOARD_VERSION", env!("CARGO_PKG_VERSION"))
            .env("PEGBOARD_PLUGIN_DIR", &self.plugin_dir)
            .env("PEGBOARD_PLUGIN_PATH", &plugin.path);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(plugin = %plugin.id, error = %e, "Failed to spawn plugin");
                return RunRecord {
                    started_at,
                    duration_ms: elapsed_ms(started),
                    status: RunStatus::Failure,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("failed to spawn: {e}")),
                };
            }
        };

        let drain_stop = CancellationToken::new();
        let _drain_guard = drain_stop.clone().drop_guard();
        let stdout_task = tokio::spawn(read_pipe(child.stdout.take(), drain_stop.clone()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take(), drain_stop.clone()));

        let timeout = (plugin.schedule != Schedule::Streamable).then_some(self.run_timeout);
        let (status, error) = match wait_with_timeout(&mut child, timeout).await {
            WaitOutcome::Exited(status) => (Some(status), None),
            WaitOutcome::TimedOut => {
                warn!(
                    plugin = %plugin.id,
                    timeout_secs = self.run_timeout.as_secs(),
                    "Plugin timed out, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(plugin = %plugin.id, error = %e, "Failed to kill timed-out plugin");
                }
                (
                    None,
                    Some(format!(
                        "timed out after {}s",
                        self.run_timeout.as_secs()
                    )),
                )
            }
            WaitOutcome::WaitFailed(e) => (None, Some(format!("failed to wait for plugin: {e}"))),
        };

        // The pipes hit EOF once the process and everything it spawned
        // are gone. A backgrounded grandchild inherits the write ends
        // and can hold them open, so the drain gets a grace period and
        // then keeps whatever has arrived.
        let drain_deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE;
        let stdout_bytes = drain_pipe(stdout_task, drain_deadline, &drain_stop).await;
        let stderr_bytes = drain_pipe(stderr_task, drain_deadline, &drain_stop).await;
        if drain_stop.is_cancelled() {
            debug!(plugin = %plugin.id, "Output pipes still open after exit, taking partial output");
        }
        let stdout = truncate_output(stdout_bytes, self.max_output_bytes);
        let stderr = truncate_output(stderr_bytes, self.max_output_bytes);

        let exit_code = status.and_then(|s| s.code());
        let success = error.is_none() && status.map(|s| s.success()).unwrap_or(false);
        if !success && error.is_none() {
            warn!(plugin = %plugin.id, exit_code = ?exit_code, "Plugin exited with failure");
        }

        RunRecord {
            started_at,
            duration_ms: elapsed_ms(started),
            status: if success {
                RunStatus::Success
            } else {
                RunStatus::Failure
            },
            exit_code,
            stdout,
            stderr,
            error,
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    WaitFailed(std::io::Error),
}

async fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> WaitOutcome {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => WaitOutcome::Exited(status),
            Ok(Err(e)) => WaitOutcome::WaitFailed(e),
            Err(_) => WaitOutcome::TimedOut,
        },
        None => match child.wait().await {
            Ok(status) => WaitOutcome::Exited(status),
            Err(e) => WaitOutcome::WaitFailed(e),
        },
    }
}

/// Join a pipe reader, giving it until `deadline` to reach EOF. Past
/// the deadline the reader is stopped and whatever it collected so far
/// is kept.
async fn drain_pipe(
    mut task: tokio::task::JoinHandle<Vec<u8>>,
    deadline: tokio::time::Instant,
    stop: &CancellationToken,
) -> Vec<u8> {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            stop.cancel();
            task.await.unwrap_or_default()
        }
    }
}

/// Read a pipe until EOF or until `stop` fires, keeping what arrived.
async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(
    pipe: Option<R>,
    stop: CancellationToken,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut pipe) = pipe else {
        return buf;
    };
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            read = pipe.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            },
        }
    }
    buf
}

/// Lossy-decode captured output, capping it at `max` bytes.
fn truncate_output(bytes: Vec<u8>, max: usize) -> String {
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[output truncated]");
    }
    text
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
