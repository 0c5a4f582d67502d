use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use relay_core::current_unix_timestamp_ms;

use crate::monitor::ProcessMonitor;
use crate::terminal::{detect_terminal, shell_escape, LaunchRequest, TerminalKind, TerminalLauncher};

const SESSION_ID_PREFIX: &str = "sess";
const EVENT_CHANNEL_CAPACITY: usize = 64;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> String {
    let now = current_unix_timestamp_ms();
    let suffix = SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{SESSION_ID_PREFIX}-{now}-{suffix:04}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Ended,
    Error,
}

impl SessionStatus {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }
}

/// One interactive tool running in an external terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveSession {
    pub id: String,
    pub working_directory: PathBuf,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_terminal: Option<TerminalKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Options for starting a session.
#[derive(Debug, Clone, Default)]
pub struct StartSessionOptions {
    pub working_directory: PathBuf,
    /// Interactive tool executable; defaults to `copilot`.
    pub tool: Option<String>,
    pub preferred_terminal: Option<TerminalKind>,
    pub initial_prompt: Option<String>,
    pub custom_name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started(InteractiveSession),
    Updated(InteractiveSession),
    Ended(InteractiveSession),
    Error(InteractiveSession),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    pub starting: usize,
    pub active: usize,
    pub ended: usize,
    pub error: usize,
    pub total: usize,
}

struct ManagerInner {
    launcher: Arc<dyn TerminalLauncher>,
    monitor: ProcessMonitor,
    state: Mutex<HashMap<String, InteractiveSession>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Orchestrates external-terminal sessions: spawns the terminal, tracks
/// the tool PID through the process monitor, and transitions the session
/// record as the underlying process lives and dies.
#[derive(Clone)]
pub struct InteractiveSessionManager {
    inner: Arc<ManagerInner>,
}

impl InteractiveSessionManager {
    pub fn new(launcher: Arc<dyn TerminalLauncher>, monitor: ProcessMonitor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                launcher,
                monitor,
                state: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Creates a session record, launches the terminal, and arms the
    /// termination watch. Returns `None` when the spawn failed; the
    /// record is kept in `error` state for inspection.
    pub async fn start(&self, options: StartSessionOptions) -> Option<String> {
        let id = next_session_id();
        let tool = options.tool.unwrap_or_else(|| "copilot".to_string());
        let session = InteractiveSession {
            id: id.clone(),
            working_directory: options.working_directory.clone(),
            tool: tool.clone(),
            preferred_terminal: options.preferred_terminal,
            pid: None,
            status: SessionStatus::Starting,
            start_time: Utc::now(),
            end_time: None,
            custom_name: options.custom_name,
            initial_prompt: options.initial_prompt.clone(),
            error: None,
        };
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.insert(id.clone(), session.clone());
            let _ = self.inner.events.send(SessionEvent::Started(session));
        }

        let Some(terminal) = detect_terminal(options.preferred_terminal) else {
            self.transition_error(&id, "no terminal emulator available");
            return None;
        };

        let mut command = shell_escape(&tool);
        if let Some(prompt) = &options.initial_prompt {
            command.push(' ');
            command.push_str(&shell_escape(prompt));
        }
        let request = LaunchRequest {
            terminal,
            working_directory: options.working_directory,
            command,
            session_id: id.clone(),
        };

        match self.inner.launcher.launch(&request).await {
            Ok(pid) => {
                {
                    let mut state = lock_unpoisoned(&self.inner.state);
                    if let Some(session) = state.get_mut(&id) {
                        session.pid = Some(pid);
                        session.status = SessionStatus::Active;
                        let _ = self
                            .inner
                            .events
                            .send(SessionEvent::Updated(session.clone()));
                    }
                }
                let manager = self.clone();
                let watched = id.clone();
                self.inner
                    .monitor
                    .start_monitoring(id.clone(), pid as i64, move || {
                        manager.transition_ended(&watched);
                    });
                Some(id)
            }
            Err(error) => {
                warn!(session = id.as_str(), "terminal spawn failed: {error}");
                self.transition_error(&id, &error.to_string());
                None
            }
        }
    }

    /// Force-ends a session and stops its termination watch.
    pub fn end(&self, id: &str) {
        self.inner.monitor.stop_monitoring(id);
        self.transition_ended(id);
    }

    /// Deletes a session record; live sessions are left untouched.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        match state.get(id) {
            Some(session) if !session.status.is_live() => {
                state.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn rename(&self, id: &str, name: impl Into<String>) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if let Some(session) = state.get_mut(id) {
            session.custom_name = Some(name.into());
            let _ = self
                .inner
                .events
                .send(SessionEvent::Updated(session.clone()));
        }
    }

    /// All sessions, newest first.
    pub fn all(&self) -> Vec<InteractiveSession> {
        let state = lock_unpoisoned(&self.inner.state);
        let mut sessions: Vec<InteractiveSession> = state.values().cloned().collect();
        sessions.sort_by(|left, right| {
            right
                .start_time
                .cmp(&left.start_time)
                .then_with(|| left.id.cmp(&right.id))
        });
        sessions
    }

    pub fn active(&self) -> Vec<InteractiveSession> {
        self.all()
            .into_iter()
            .filter(|session| session.status.is_live())
            .collect()
    }

    pub fn ended(&self) -> Vec<InteractiveSession> {
        self.all()
            .into_iter()
            .filter(|session| session.status == SessionStatus::Ended)
            .collect()
    }

    pub fn counts(&self) -> SessionCounts {
        let state = lock_unpoisoned(&self.inner.state);
        let mut counts = SessionCounts::default();
        for session in state.values() {
            counts.total += 1;
            match session.status {
                SessionStatus::Starting => counts.starting += 1,
                SessionStatus::Active => counts.active += 1,
                SessionStatus::Ended => counts.ended += 1,
                SessionStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    pub fn has_active(&self) -> bool {
        let state = lock_unpoisoned(&self.inner.state);
        state.values().any(|session| session.status.is_live())
    }

    /// Drops every ended or errored session record.
    pub fn clear_ended(&self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.retain(|_, session| session.status.is_live());
    }

    pub fn get(&self, id: &str) -> Option<InteractiveSession> {
        lock_unpoisoned(&self.inner.state).get(id).cloned()
    }

    fn transition_ended(&self, id: &str) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if let Some(session) = state.get_mut(id) {
            if session.status.is_live() {
                session.status = SessionStatus::Ended;
                session.end_time = Some(Utc::now());
                let _ = self.inner.events.send(SessionEvent::Ended(session.clone()));
            }
        }
    }

    fn transition_error(&self, id: &str, error: &str) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if let Some(session) = state.get_mut(id) {
            session.status = SessionStatus::Error;
            session.error = Some(error.to_string());
            session.end_time = Some(Utc::now());
            let _ = self.inner.events.send(SessionEvent::Error(session.clone()));
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
