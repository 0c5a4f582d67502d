use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

/// Enumerates the ways a prompt can be executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-process SDK session; the only backend that yields a resumable session id.
    #[default]
    Sdk,
    /// External CLI subprocess with captured stdout/stderr.
    Cli,
    /// Hand-off that copies the prompt to the system clipboard.
    Clipboard,
}

impl BackendKind {
    /// Returns the stable kebab-case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sdk => "sdk",
            Self::Cli => "cli",
            Self::Clipboard => "clipboard",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumerates the failure modes of a backend invocation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend invocation failed: {0}")]
    Invocation(String),
    #[error("invocation exceeded timeout of {0}ms")]
    Timeout(u64),
    #[error("invocation was cancelled")]
    Cancelled,
    #[error("failed to spawn backend process: {0}")]
    Spawn(String),
    #[error("clipboard write failed: {0}")]
    Clipboard(String),
}

/// A tool-permission prompt surfaced by the SDK mid-invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    pub tool: String,
    pub description: String,
}

/// Caller-supplied approval callback; returning false denies the tool use.
pub type PermissionHandler = Arc<dyn Fn(&PermissionRequest) -> bool + Send + Sync>;

/// Per-invocation configuration resolved by the caller.
#[derive(Clone, Default)]
pub struct InvokeOptions {
    pub backend: BackendKind,
    /// Check a session out of the pool instead of opening an ephemeral one.
    pub use_pool: bool,
    /// Binds the SDK session and sets the CLI subprocess working directory.
    pub working_directory: Option<PathBuf>,
    /// Copy the prompt to the clipboard as a last resort when the chain fails.
    pub clipboard_fallback: bool,
    /// Diagnostic label naming the feature that issued the invocation.
    pub feature_name: Option<String>,
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
    /// When set, raw CLI stdout is kept at this path instead of a temp file.
    pub raw_stdout_path: Option<PathBuf>,
    pub on_permission_request: Option<PermissionHandler>,
}

impl std::fmt::Debug for InvokeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeOptions")
            .field("backend", &self.backend)
            .field("use_pool", &self.use_pool)
            .field("working_directory", &self.working_directory)
            .field("clipboard_fallback", &self.clipboard_fallback)
            .field("feature_name", &self.feature_name)
            .field("model", &self.model)
            .field("timeout_ms", &self.timeout_ms)
            .field("raw_stdout_path", &self.raw_stdout_path)
            .finish()
    }
}

/// Unified result of a backend invocation.
///
/// `session_id` is populated only when the SDK backend succeeded; a
/// clipboard hand-off always reports `success = false` with an
/// explanatory error so callers never mistake it for a completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_used: Option<BackendKind>,
    #[serde(default)]
    pub cancelled: bool,
}

impl InvokeOutcome {
    pub fn completed(response: String, session_id: Option<String>, backend: BackendKind) -> Self {
        Self {
            success: true,
            response: Some(response),
            session_id,
            error: None,
            backend_used: Some(backend),
            cancelled: false,
        }
    }

    pub fn failed(error: String, backend: Option<BackendKind>) -> Self {
        Self {
            success: false,
            response: None,
            session_id: None,
            error: Some(error),
            backend_used: backend,
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            response: None,
            session_id: None,
            error: Some("invocation was cancelled".to_string()),
            backend_used: None,
            cancelled: true,
        }
    }
}

#[derive(Default)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Clonable cancellation flag shared between the executor and a running
/// backend invocation.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled and wakes every waiter. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled; returns immediately when it
    /// already is.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
