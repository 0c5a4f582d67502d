use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

use relay_core::{current_iso_timestamp, current_unix_timestamp_ms, write_text_atomic, Debouncer};

use crate::queue::TaskQueueManager;
use crate::task::{Task, TaskInput, TaskStatus};

const QUEUE_SNAPSHOT_VERSION: u32 = 1;
const QUEUE_SNAPSHOT_FILE: &str = "queue.json";
const PERSISTED_HISTORY_LIMIT: usize = 100;
const RESTART_FAILURE_REASON: &str = "Server restarted while task was running";

/// Persisted form of the queue: pending tasks (queued and running at
/// snapshot time) plus bounded terminal history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub version: u32,
    pub saved_at: String,
    pub pending: Vec<Task>,
    pub history: Vec<Task>,
}

/// Tuning for the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePersistenceConfig {
    pub debounce: Duration,
}

impl Default for QueuePersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
        }
    }
}

struct PersistenceInner {
    path: PathBuf,
    queue: TaskQueueManager,
    debouncer: Debouncer,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Durable snapshot writer/reader for the queue.
///
/// Saves are triggered by queue change events, coalesced by a debounce
/// window, and written via a temp file + atomic rename. Restores treat a
/// missing or corrupt file as empty state.
#[derive(Clone)]
pub struct QueuePersistence {
    inner: Arc<PersistenceInner>,
}

impl QueuePersistence {
    pub fn new(
        data_dir: &Path,
        queue: TaskQueueManager,
        config: QueuePersistenceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PersistenceInner {
                path: data_dir.join(QUEUE_SNAPSHOT_FILE),
                queue,
                debouncer: Debouncer::new(config.debounce),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Reads the snapshot and rebuilds queue state:
    /// queued pending tasks are re-enqueued under fresh ids (priority,
    /// payload, config, display name, and creation time preserved);
    /// running pending tasks land in history as failed with the restart
    /// reason; history entries are restored verbatim.
    pub fn restore(&self) {
        let Some(snapshot) = self.read_snapshot() else {
            return;
        };

        for task in snapshot.history {
            self.inner.queue.restore_history_entry(task);
        }

        for task in snapshot.pending {
            match task.status {
                TaskStatus::Queued => {
                    let input = TaskInput {
                        kind: task.kind,
                        priority: Some(task.priority),
                        payload: task.payload,
                        config: task.config,
                        display_name: task.display_name,
                    };
                    if let Err(error) = self
                        .inner
                        .queue
                        .enqueue_with_created_at(input, task.created_at)
                    {
                        warn!("failed to re-enqueue restored task: {error}");
                    }
                }
                TaskStatus::Running => {
                    let mut failed = task;
                    failed.status = TaskStatus::Failed;
                    failed.error = Some(RESTART_FAILURE_REASON.to_string());
                    failed.completed_at = Some(current_unix_timestamp_ms());
                    self.inner.queue.restore_history_entry(failed);
                }
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    // Terminal tasks belong in the history array; tolerate
                    // hand-edited files by restoring them there.
                    self.inner.queue.restore_history_entry(task);
                }
            }
        }
    }

    /// Starts the change listener that schedules debounced saves.
    pub fn start(&self) {
        let mut listener = lock_unpoisoned(&self.inner.listener);
        if listener.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut events = self.inner.queue.subscribe();
        *listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_event) => {
                        let save_inner = Arc::clone(&inner);
                        inner.debouncer.schedule(move || save_now(&save_inner));
                    }
                    Err(RecvError::Lagged(_)) => {
                        let save_inner = Arc::clone(&inner);
                        inner.debouncer.schedule(move || save_now(&save_inner));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Flushes any pending save synchronously and stops the listener.
    pub fn dispose(&self) {
        if let Some(listener) = lock_unpoisoned(&self.inner.listener).take() {
            listener.abort();
        }
        self.inner.debouncer.flush();
    }

    /// Writes a snapshot immediately, bypassing the debounce window.
    pub fn save_now(&self) {
        save_now(&self.inner);
    }

    fn read_snapshot(&self) -> Option<QueueSnapshot> {
        if !self.inner.path.exists() {
            return None;
        }
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(
                    "failed to read queue snapshot {}: {error}",
                    self.inner.path.display()
                );
                return None;
            }
        };
        let snapshot = match serde_json::from_str::<QueueSnapshot>(&raw) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(
                    "discarding unparseable queue snapshot {}: {error}",
                    self.inner.path.display()
                );
                return None;
            }
        };
        if snapshot.version != QUEUE_SNAPSHOT_VERSION {
            warn!(
                "discarding queue snapshot {} with unknown version {}",
                self.inner.path.display(),
                snapshot.version
            );
            return None;
        }
        Some(snapshot)
    }
}

fn save_now(inner: &PersistenceInner) {
    let (pending, mut history) = inner.queue.snapshot_parts();
    if history.len() > PERSISTED_HISTORY_LIMIT {
        let excess = history.len() - PERSISTED_HISTORY_LIMIT;
        history.drain(..excess);
    }
    let snapshot = QueueSnapshot {
        version: QUEUE_SNAPSHOT_VERSION,
        saved_at: current_iso_timestamp(),
        pending,
        history,
    };
    let payload = match serde_json::to_string_pretty(&snapshot) {
        Ok(mut payload) => {
            payload.push('\n');
            payload
        }
        Err(error) => {
            warn!("failed to encode queue snapshot: {error}");
            return;
        }
    };
    if let Err(error) = write_text_atomic(&inner.path, &payload) {
        warn!("queue snapshot save failed: {error}");
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
