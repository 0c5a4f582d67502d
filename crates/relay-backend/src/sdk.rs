use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{BackendError, PermissionHandler};

/// Result of probing whether the SDK backend can take requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdkAvailability {
    pub available: bool,
    pub error: Option<String>,
}

impl SdkAvailability {
    pub fn available() -> Self {
        Self {
            available: true,
            error: None,
        }
    }

    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            available: false,
            error: Some(error.into()),
        }
    }
}

/// One prompt turn sent over an open SDK session.
#[derive(Clone, Default)]
pub struct SdkSendRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub on_permission_request: Option<PermissionHandler>,
}

impl std::fmt::Debug for SdkSendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkSendRequest")
            .field("prompt_len", &self.prompt.len())
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkReply {
    pub response: String,
    /// Identifier that allows resuming this session later.
    pub session_id: Option<String>,
}

/// A stateful SDK session bound to one working directory.
#[async_trait]
pub trait SdkSession: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, request: SdkSendRequest) -> Result<SdkReply, BackendError>;

    /// Releases backend-side resources. Idempotent.
    async fn close(&self);
}

/// Seam over the in-process SDK. Implementations are external; the core
/// only relies on availability probing, session lifecycle, and abort.
#[async_trait]
pub trait SdkClient: Send + Sync {
    async fn availability(&self) -> SdkAvailability;

    async fn open_session(
        &self,
        working_directory: Option<&Path>,
    ) -> Result<Arc<dyn SdkSession>, BackendError>;

    /// Interrupts an in-flight send on the identified session. Best effort.
    async fn abort(&self, session_id: &str);
}
