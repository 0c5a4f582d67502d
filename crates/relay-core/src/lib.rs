//! Foundational low-level utilities shared across Relay crates.
//!
//! Provides atomic file-write helpers, time utilities, and the debounced
//! write coalescer used by queue and registry persistence.

pub mod atomic_io;
pub mod debounce;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use debounce::{spawn_background_future, Debouncer};
pub use time_utils::{current_iso_timestamp, current_unix_timestamp, current_unix_timestamp_ms};
