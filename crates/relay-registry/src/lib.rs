//! Authoritative in-memory map of tracked AI invocations.
//!
//! Every invocation — single call or group — is a [`ProcessRecord`] owned
//! exclusively by the [`ProcessRegistry`]. Mutations emit change events and
//! schedule a debounced save to a file-backed store so a restart can mark
//! interrupted work as failed.

pub mod process;
pub mod registry;
pub mod store;

pub use process::{
    GroupMetadata, ProcessCounts, ProcessEvent, ProcessRecord, ProcessStatus, RegisterOptions,
    SessionMetadata,
};
pub use registry::{ProcessRegistry, ProcessRegistryConfig};
pub use store::RegistryStore;
