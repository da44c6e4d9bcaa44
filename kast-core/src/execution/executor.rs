use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::ExecutionRequest;
use super::plugins::{PluginInfo, parse_plugin_listing};
use crate::config::ExecutorConfig;
use crate::error::{Result, ScanError};

/// Bound on waiting for pipe readers after the child has been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);
/// Lines of stderr kept for the job's error detail.
const STDERR_TAIL_LINES: usize = 20;

/// How a tool run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionDisposition {
    /// Exit status zero.
    Success,
    /// Non-zero exit, or terminated by a signal.
    Failure,
    /// Killed after the configured timeout.
    Timeout,
}

impl ExecutionDisposition {
    /// Name written to logs and the transcript.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionDisposition::Success => "success",
            ExecutionDisposition::Failure => "failure",
            ExecutionDisposition::Timeout => "timeout",
        }
    }
}

/// Result of one tool run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// How the run ended.
    pub disposition: ExecutionDisposition,
    /// `None` when the child was killed or terminated by a signal.
    pub exit_code: Option<i32>,
    /// Set when the transcript file was written.
    pub transcript_path: Option<PathBuf>,
    /// Last lines of stderr.
    pub stderr_tail: String,
}

impl ExecutionOutcome {
    /// The run exited cleanly.
    pub fn succeeded(&self) -> bool {
        self.disposition == ExecutionDisposition::Success
    }

    /// Top-level error recorded on a failed job.
    pub fn error_summary(&self, timeout: Duration) -> Option<String> {
        match self.disposition {
            ExecutionDisposition::Success => None,
            ExecutionDisposition::Timeout => {
                Some(format!("scan timed out after {} seconds", timeout.as_secs()))
            }
            ExecutionDisposition::Failure => {
                let code = self
                    .exit_code
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                if self.stderr_tail.trim().is_empty() {
                    Some(format!("scan exited with status {code}"))
                } else {
                    Some(format!(
                        "scan exited with status {code}: {}",
                        self.stderr_tail.trim()
                    ))
                }
            }
        }
    }
}

/// Runs the external tool for one job.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    /// Run to completion or timeout. `Err` means the tool could not be run at
    /// all; a non-zero exit is an `Ok` outcome with a failure disposition.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome>;

    /// Ask the tool which plugins it knows about.
    async fn list_plugins(&self) -> Result<Vec<PluginInfo>>;
}

/// [`ScanExecutor`] backed by the kast CLI.
#[derive(Clone, Debug)]
pub struct KastCliExecutor {
    config: ExecutorConfig,
}

impl KastCliExecutor {
    /// An executor for the configured binary.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn command_line(&self, request: &ExecutionRequest) -> String {
        std::iter::once(self.config.cli_path.as_os_str().to_os_string())
            .chain(request.args())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ScanExecutor for KastCliExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let transcript_path = request.output_dir.join(&self.config.transcript_file);
        let started_at = Utc::now();
        let mut transcript = Transcript::new(request, started_at, &self.command_line(request));

        info!(
            job_id = %request.job_id,
            target = %request.target,
            mode = %request.mode,
            output_dir = %request.output_dir.display(),
            "starting scan"
        );

        let spawned = Command::new(&self.config.cli_path)
            .args(request.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!(
                    "failed to start {}: {e}",
                    self.config.cli_path.display()
                );
                transcript.finish_unstarted(&message, Utc::now());
                transcript.write(&transcript_path).await;
                return Err(ScanError::Execution(message));
            }
        };

        let stdout = spawn_drain(child.stdout.take());
        let stderr = spawn_drain(child.stderr.take());

        let (status, timed_out) =
            match tokio::time::timeout(self.config.timeout, child.wait()).await {
                Ok(status) => (Some(status?), false),
                Err(_) => {
                    warn!(
                        job_id = %request.job_id,
                        timeout_secs = self.config.timeout.as_secs(),
                        "scan timed out; killing process"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %request.job_id, error = %e, "failed to kill scan process");
                    }
                    (None, true)
                }
            };

        let stdout = collect_drain(stdout).await;
        let stderr = collect_drain(stderr).await;

        let (disposition, exit_code) = classify(status, timed_out);
        let completed_at = Utc::now();
        transcript.finish(&stdout, &stderr, disposition, exit_code, completed_at);
        let transcript_path = transcript
            .write(&transcript_path)
            .await
            .then_some(transcript_path);

        info!(
            job_id = %request.job_id,
            disposition = disposition.as_str(),
            exit_code = ?exit_code,
            elapsed_ms = (completed_at - started_at).num_milliseconds(),
            "scan process finished"
        );

        Ok(ExecutionOutcome {
            disposition,
            exit_code,
            transcript_path,
            stderr_tail: tail_lines(&stderr, STDERR_TAIL_LINES),
        })
    }

    async fn list_plugins(&self) -> Result<Vec<PluginInfo>> {
        let output = tokio::time::timeout(
            self.config.list_plugins_timeout,
            Command::new(&self.config.cli_path)
                .arg("--list-plugins")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ScanError::Execution("plugin listing timed out".into()))?
        .map_err(|e| {
            ScanError::Execution(format!(
                "failed to start {}: {e}",
                self.config.cli_path.display()
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::Execution(format!(
                "plugin listing failed: {}",
                stderr.trim()
            )));
        }

        let plugins = parse_plugin_listing(&String::from_utf8_lossy(&output.stdout));
        debug!(count = plugins.len(), "listed plugins");
        Ok(plugins)
    }
}

fn classify(status: Option<ExitStatus>, timed_out: bool) -> (ExecutionDisposition, Option<i32>) {
    match status {
        _ if timed_out => (ExecutionDisposition::Timeout, None),
        Some(status) if status.success() => (ExecutionDisposition::Success, status.code()),
        Some(status) => (ExecutionDisposition::Failure, status.code()),
        None => (ExecutionDisposition::Failure, None),
    }
}

/// Read a pipe to the end on its own task so a full stdout cannot block a
/// child that is still writing stderr.
fn spawn_drain<R>(pipe: Option<R>) -> Option<JoinHandle<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!(error = %e, "pipe read ended early");
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

async fn collect_drain(handle: Option<JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(error = %e, "pipe reader failed");
            String::new()
        }
        Err(_) => {
            // A grandchild still holds the pipe open.
            abort.abort();
            String::new()
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// The executor's own record of one invocation.
struct Transcript {
    body: String,
}

impl Transcript {
    fn new(request: &ExecutionRequest, started_at: DateTime<Utc>, command_line: &str) -> Self {
        let mut body = String::new();
        let _ = writeln!(body, "=== kast execution ===");
        let _ = writeln!(body, "job: {}", request.job_id);
        let _ = writeln!(body, "target: {}", request.target);
        let _ = writeln!(body, "mode: {}", request.mode);
        let _ = writeln!(body, "started: {}", started_at.to_rfc3339());
        let _ = writeln!(body, "command: {command_line}");
        Self { body }
    }

    fn finish(
        &mut self,
        stdout: &str,
        stderr: &str,
        disposition: ExecutionDisposition,
        exit_code: Option<i32>,
        completed_at: DateTime<Utc>,
    ) {
        let _ = write!(self.body, "\n=== stdout ===\n{stdout}");
        if !stdout.is_empty() && !stdout.ends_with('\n') {
            self.body.push('\n');
        }
        let _ = write!(self.body, "\n=== stderr ===\n{stderr}");
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            self.body.push('\n');
        }
        let _ = writeln!(self.body, "\n=== result ===");
        let _ = writeln!(self.body, "disposition: {}", disposition.as_str());
        match exit_code {
            Some(code) => {
                let _ = writeln!(self.body, "exit_code: {code}");
            }
            None => {
                let _ = writeln!(self.body, "exit_code: none");
            }
        }
        let _ = writeln!(self.body, "completed: {}", completed_at.to_rfc3339());
    }

    fn finish_unstarted(&mut self, message: &str, completed_at: DateTime<Utc>) {
        let _ = writeln!(self.body, "\n=== result ===");
        let _ = writeln!(self.body, "disposition: failure");
        let _ = writeln!(self.body, "error: {message}");
        let _ = writeln!(self.body, "completed: {}", completed_at.to_rfc3339());
    }

    /// Returns whether the transcript reached disk.
    async fn write(&self, path: &Path) -> bool {
        match tokio::fs::write(path, self.body.as_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write transcript");
                false
            }
        }
    }
}
