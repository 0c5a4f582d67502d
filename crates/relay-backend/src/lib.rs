//! Backend abstraction for AI invocations.
//!
//! Unifies three ways of running a prompt — an in-process SDK session, an
//! external CLI subprocess, and a clipboard hand-off — behind one invoker
//! with a deterministic fallback chain, plus a bounded pool of reusable
//! SDK sessions keyed by working directory.

pub mod cli;
pub mod clipboard;
pub mod invoker;
pub mod sdk;
pub mod session_pool;
pub mod types;

pub use cli::{CliBackend, CliConfig, CliInvokeRequest, CliInvoker, CliReply};
pub use clipboard::{ClipboardSink, SystemClipboard};
pub use invoker::{BackendInvoker, BackendInvokerConfig};
pub use sdk::{SdkAvailability, SdkClient, SdkReply, SdkSendRequest, SdkSession};
pub use session_pool::{PooledSession, SessionPool, SessionPoolConfig};
pub use types::{
    BackendError, BackendKind, CancelToken, InvokeOptions, InvokeOutcome, PermissionHandler,
    PermissionRequest,
};
