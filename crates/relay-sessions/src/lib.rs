//! Interactive CLI sessions in external terminals, tracked by PID.
//!
//! The [`ProcessMonitor`] polls OS process liveness on one shared timer,
//! the terminal module spawns detached terminal emulators with an initial
//! command, and the [`InteractiveSessionManager`] ties both together into
//! session records with lifecycle events.

pub mod manager;
pub mod monitor;
pub mod terminal;

pub use manager::{
    InteractiveSession, InteractiveSessionManager, SessionCounts, SessionEvent, SessionStatus,
    StartSessionOptions,
};
pub use monitor::{probe_pid, PidProbe, ProcessMonitor, ProcessMonitorConfig};
pub use terminal::{
    detect_terminal, focus_terminal_window, LaunchRequest, SystemTerminalLauncher,
    TerminalKind, TerminalLauncher,
};
