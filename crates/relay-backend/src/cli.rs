use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::Duration;

use relay_core::current_unix_timestamp_ms;

use crate::types::{BackendError, CancelToken};

static CLI_CAPTURE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Configuration for the CLI subprocess backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    pub executable: String,
    pub extra_args: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            executable: "copilot".to_string(),
            extra_args: Vec::new(),
            poll_interval_ms: 50,
        }
    }
}

/// One prompt execution through the CLI backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliInvokeRequest {
    pub prompt: String,
    pub working_directory: Option<PathBuf>,
    pub model: Option<String>,
    pub timeout_ms: u64,
    /// When set, raw stdout is kept at this path as an on-disk artifact.
    pub raw_stdout_path: Option<PathBuf>,
}

impl Default for CliInvokeRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            working_directory: None,
            model: None,
            timeout_ms: 1_800_000,
            raw_stdout_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliReply {
    pub response: String,
}

/// Seam over the CLI backend so tests and alternate front-ends can
/// substitute their own subprocess strategy.
#[async_trait]
pub trait CliBackend: Send + Sync {
    async fn invoke(
        &self,
        request: CliInvokeRequest,
        cancel: &CancelToken,
    ) -> Result<CliReply, BackendError>;
}

/// Concrete CLI backend: spawns the configured executable, redirects
/// stdout/stderr to capture files, and polls the child so cancellation
/// and the deadline are observed without blocking on process exit.
#[derive(Debug, Clone)]
pub struct CliInvoker {
    config: CliConfig,
}

impl CliInvoker {
    pub fn new(config: CliConfig) -> Result<Self, BackendError> {
        if config.executable.trim().is_empty() {
            return Err(BackendError::Invocation(
                "cli executable is empty".to_string(),
            ));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl CliBackend for CliInvoker {
    async fn invoke(
        &self,
        request: CliInvokeRequest,
        cancel: &CancelToken,
    ) -> Result<CliReply, BackendError> {
        let stdout_path = request
            .raw_stdout_path
            .clone()
            .unwrap_or_else(|| temp_capture_path("stdout"));
        let keep_stdout = request.raw_stdout_path.is_some();
        let stderr_path = temp_capture_path("stderr");

        let stdout_file = open_capture_file(&stdout_path)?;
        let stderr_file = open_capture_file(&stderr_path)?;

        let mut command = Command::new(&self.config.executable);
        command.arg("-p").arg(&request.prompt);
        command.arg("--output-format").arg("json");
        if let Some(model) = &request.model {
            command.arg("--model").arg(model);
        }
        command.args(&self.config.extra_args);
        if let Some(cwd) = &request.working_directory {
            command.current_dir(cwd);
        }
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::from(stdout_file));
        command.stderr(Stdio::from(stderr_file));

        let mut child = command.spawn().map_err(|error| {
            BackendError::Spawn(format!(
                "failed to spawn '{}': {error}",
                self.config.executable
            ))
        })?;

        let deadline = Instant::now() + Duration::from_millis(request.timeout_ms.max(1));
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(10));
        let result = loop {
            if cancel.is_cancelled() {
                let _ = child.kill().await;
                break Err(BackendError::Cancelled);
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                break Err(BackendError::Timeout(request.timeout_ms));
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    let stdout = read_capture(&stdout_path);
                    let stderr = read_capture(&stderr_path);
                    if status.success() {
                        break parse_cli_output(&stdout).map(|response| CliReply { response });
                    }
                    let code = status
                        .code()
                        .map(|value| value.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    break Err(BackendError::Invocation(format!(
                        "cli exited with status {code}: {}",
                        summarize_failure(&stderr, &stdout)
                    )));
                }
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(error) => {
                    let _ = child.kill().await;
                    break Err(BackendError::Invocation(format!(
                        "failed to poll cli process: {error}"
                    )));
                }
            }
        };

        if !keep_stdout {
            let _ = std::fs::remove_file(&stdout_path);
        }
        let _ = std::fs::remove_file(&stderr_path);
        result
    }
}

fn open_capture_file(path: &std::path::Path) -> Result<std::fs::File, BackendError> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|error| BackendError::Spawn(format!("failed to open {}: {error}", path.display())))
}

fn temp_capture_path(extension: &str) -> PathBuf {
    let suffix = CLI_CAPTURE_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "relay-cli-{}-{}-{suffix}.{extension}",
        std::process::id(),
        current_unix_timestamp_ms()
    ))
}

fn read_capture(path: &std::path::Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// Interprets CLI stdout: a JSON payload with an error flag fails, a JSON
/// `result` field wins, anything else is treated as plain text output.
fn parse_cli_output(stdout: &str) -> Result<String, BackendError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(BackendError::Invocation(
            "cli returned no output".to_string(),
        ));
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let message = value
                .get("result")
                .or_else(|| value.get("error"))
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|message| !message.is_empty())
                .unwrap_or("cli reported an error");
            return Err(BackendError::Invocation(format!(
                "cli returned an error payload: {message}"
            )));
        }
        if let Some(result) = value
            .get("result")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|result| !result.is_empty())
        {
            return Ok(result.to_string());
        }
    }
    Ok(trimmed.to_string())
}

fn summarize_failure(stderr: &str, stdout: &str) -> String {
    const MAX_CHARS: usize = 240;
    let detail = if !stderr.trim().is_empty() {
        stderr.trim()
    } else if !stdout.trim().is_empty() {
        stdout.trim()
    } else {
        return "no error output".to_string();
    };
    if detail.chars().count() <= MAX_CHARS {
        return detail.to_string();
    }
    detail.chars().take(MAX_CHARS).collect::<String>() + "..."
}
