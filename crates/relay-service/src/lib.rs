//! Configuration and top-level wiring for the Relay core.
//!
//! [`RelayConfig`] maps the TOML configuration surface onto the component
//! configs, [`QueueService`] assembles queue + persistence + executor +
//! registry + optional dashboard sync, and the `services` module holds the
//! process-wide instances with a reset hook for tests.

pub mod config;
pub mod service;

pub use config::RelayConfig;
pub use service::{
    init_services, process_monitor, queue_service, reset_services_for_tests, session_manager,
    QueueService, Services,
};

/// Installs the default `tracing` subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
