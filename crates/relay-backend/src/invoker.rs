use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cli::{CliBackend, CliInvokeRequest};
use crate::clipboard::ClipboardSink;
use crate::sdk::{SdkClient, SdkReply, SdkSendRequest, SdkSession};
use crate::session_pool::{SessionPool, SessionPoolConfig};
use crate::types::{BackendError, BackendKind, CancelToken, InvokeOptions, InvokeOutcome};

const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 1_800_000;

/// Configuration for the unified invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInvokerConfig {
    pub default_timeout_ms: u64,
    pub pool: SessionPoolConfig,
}

impl Default for BackendInvokerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_INVOKE_TIMEOUT_MS,
            pool: SessionPoolConfig::default(),
        }
    }
}

/// Unifies the SDK, CLI, and clipboard backends behind one `invoke` call
/// with a deterministic fallback chain:
///
/// 1. clipboard backend: copy and report a non-success hand-off.
/// 2. sdk backend: on unavailability, invocation error, or timeout fall
///    back to the CLI.
/// 3. cli backend: invoke the subprocess directly.
/// 4. CLI failure with `clipboard_fallback` enabled: copy and report.
pub struct BackendInvoker {
    sdk: Arc<dyn SdkClient>,
    cli: Arc<dyn CliBackend>,
    clipboard: Arc<dyn ClipboardSink>,
    pool: SessionPool,
    config: BackendInvokerConfig,
}

impl BackendInvoker {
    pub fn new(
        sdk: Arc<dyn SdkClient>,
        cli: Arc<dyn CliBackend>,
        clipboard: Arc<dyn ClipboardSink>,
        config: BackendInvokerConfig,
    ) -> Self {
        let pool = SessionPool::new(Arc::clone(&sdk), config.pool);
        Self {
            sdk,
            cli,
            clipboard,
            pool,
            config,
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
        cancel: &CancelToken,
    ) -> InvokeOutcome {
        if cancel.is_cancelled() {
            return InvokeOutcome::cancelled();
        }

        match options.backend {
            BackendKind::Clipboard => {
                self.clipboard_handoff(prompt, "clipboard backend selected")
            }
            BackendKind::Sdk => match self.try_sdk(prompt, options, cancel).await {
                Ok(outcome) => outcome,
                Err(BackendError::Cancelled) => InvokeOutcome::cancelled(),
                Err(error) => {
                    warn!(
                        feature = options.feature_name.as_deref().unwrap_or("unknown"),
                        "sdk backend failed, falling back to cli: {error}"
                    );
                    self.try_cli(prompt, options, cancel, Some(error)).await
                }
            },
            BackendKind::Cli => self.try_cli(prompt, options, cancel, None).await,
        }
    }

    async fn try_sdk(
        &self,
        prompt: &str,
        options: &InvokeOptions,
        cancel: &CancelToken,
    ) -> Result<InvokeOutcome, BackendError> {
        let availability = self.sdk.availability().await;
        if !availability.available {
            return Err(BackendError::Unavailable(
                availability
                    .error
                    .unwrap_or_else(|| "sdk backend reported unavailable".to_string()),
            ));
        }

        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let working_directory = options.working_directory.as_deref();

        if options.use_pool {
            let pooled = self.pool.checkout(working_directory).await?;
            let reply = self
                .send_on_session(pooled.session.as_ref(), prompt, options, cancel, timeout_ms)
                .await;
            self.pool.checkin(pooled).await;
            reply.map(sdk_outcome)
        } else {
            let session = self.sdk.open_session(working_directory).await?;
            let reply = self
                .send_on_session(session.as_ref(), prompt, options, cancel, timeout_ms)
                .await;
            session.close().await;
            reply.map(sdk_outcome)
        }
    }

    async fn send_on_session(
        &self,
        session: &dyn SdkSession,
        prompt: &str,
        options: &InvokeOptions,
        cancel: &CancelToken,
        timeout_ms: u64,
    ) -> Result<SdkReply, BackendError> {
        let request = SdkSendRequest {
            prompt: prompt.to_string(),
            model: options.model.clone(),
            on_permission_request: options.on_permission_request.clone(),
        };
        let send = session.send(request);
        tokio::select! {
            reply = tokio::time::timeout(Duration::from_millis(timeout_ms.max(1)), send) => {
                match reply {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(error)) => Err(error),
                    Err(_) => {
                        self.sdk.abort(session.id()).await;
                        Err(BackendError::Timeout(timeout_ms))
                    }
                }
            }
            _ = cancel.cancelled() => {
                self.sdk.abort(session.id()).await;
                Err(BackendError::Cancelled)
            }
        }
    }

    async fn try_cli(
        &self,
        prompt: &str,
        options: &InvokeOptions,
        cancel: &CancelToken,
        sdk_error: Option<BackendError>,
    ) -> InvokeOutcome {
        let request = CliInvokeRequest {
            prompt: prompt.to_string(),
            working_directory: options.working_directory.clone(),
            model: options.model.clone(),
            timeout_ms: options.timeout_ms.unwrap_or(self.config.default_timeout_ms),
            raw_stdout_path: options.raw_stdout_path.clone(),
        };

        match self.cli.invoke(request, cancel).await {
            Ok(reply) => {
                debug!(
                    feature = options.feature_name.as_deref().unwrap_or("unknown"),
                    "cli backend completed"
                );
                InvokeOutcome::completed(reply.response, None, BackendKind::Cli)
            }
            Err(BackendError::Cancelled) => InvokeOutcome::cancelled(),
            Err(cli_error) => {
                if options.clipboard_fallback {
                    return self.clipboard_handoff(
                        prompt,
                        &format!("all backends failed, last error: {cli_error}"),
                    );
                }
                let message = match sdk_error {
                    Some(sdk_error) => format!("sdk failed ({sdk_error}); cli failed ({cli_error})"),
                    None => cli_error.to_string(),
                };
                InvokeOutcome::failed(message, Some(BackendKind::Cli))
            }
        }
    }

    fn clipboard_handoff(&self, prompt: &str, reason: &str) -> InvokeOutcome {
        match self.clipboard.copy(prompt) {
            Ok(()) => InvokeOutcome {
                success: false,
                response: None,
                session_id: None,
                error: Some(format!("prompt copied to clipboard: {reason}")),
                backend_used: Some(BackendKind::Clipboard),
                cancelled: false,
            },
            Err(error) => InvokeOutcome::failed(
                format!("clipboard hand-off failed: {error}"),
                Some(BackendKind::Clipboard),
            ),
        }
    }
}

fn sdk_outcome(reply: SdkReply) -> InvokeOutcome {
    InvokeOutcome::completed(reply.response, reply.session_id, BackendKind::Sdk)
}
