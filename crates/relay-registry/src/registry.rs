use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::warn;

use relay_core::{current_unix_timestamp_ms, Debouncer};

use crate::process::{
    prompt_preview, GroupMetadata, ProcessCounts, ProcessEvent, ProcessRecord, ProcessStatus,
    RegisterOptions, SessionMetadata,
};
use crate::store::RegistryStore;

const PROCESS_ID_PREFIX: &str = "proc";
const RESTART_FAILURE_REASON: &str = "Service restarted while process was running";
const EVENT_CHANNEL_CAPACITY: usize = 256;

static PROCESS_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_process_id() -> String {
    let now = current_unix_timestamp_ms();
    let suffix = PROCESS_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{PROCESS_ID_PREFIX}-{now}-{suffix:04}")
}

/// Tuning for the registry's persistence behavior. The history limit
/// lives on the store, which owns pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRegistryConfig {
    pub debounce: Duration,
}

impl Default for ProcessRegistryConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

struct RegistryInner {
    state: Mutex<HashMap<String, ProcessRecord>>,
    events: broadcast::Sender<ProcessEvent>,
    store: Option<RegistryStore>,
    debouncer: Debouncer,
}

/// Authoritative owner of process records.
///
/// All mutations happen under one lock held only across in-memory updates;
/// change events are emitted in mutation order, and every mutation
/// schedules a debounced store save. Terminal states are final.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    pub fn new(config: ProcessRegistryConfig) -> Self {
        Self::build(None, config)
    }

    pub fn with_store(store: RegistryStore, config: ProcessRegistryConfig) -> Self {
        Self::build(Some(store), config)
    }

    fn build(store: Option<RegistryStore>, config: ProcessRegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(HashMap::new()),
                events,
                store,
                debouncer: Debouncer::new(config.debounce),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events.subscribe()
    }

    /// Loads persisted records, marking anything that was `running` when
    /// the previous process died as failed with the restart reason.
    pub fn restore(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let mut restored = store.load();
        let now = Utc::now();
        for record in restored.values_mut() {
            if record.status == ProcessStatus::Running {
                record.status = ProcessStatus::Failed;
                record.error = Some(RESTART_FAILURE_REASON.to_string());
                record.end_time = Some(now);
            }
        }
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            *state = restored;
        }
        self.schedule_save();
    }

    /// Creates a `running` process and returns its id.
    pub fn register(&self, prompt: &str, options: RegisterOptions) -> String {
        self.register_record(prompt, options, None)
    }

    /// Creates a `running` group process with an empty child list.
    pub fn register_group(&self, prompt: &str, options: RegisterOptions) -> String {
        self.register_record(prompt, options, Some(GroupMetadata::default()))
    }

    fn register_record(
        &self,
        prompt: &str,
        options: RegisterOptions,
        group_metadata: Option<GroupMetadata>,
    ) -> String {
        let id = next_process_id();
        let record = ProcessRecord {
            id: id.clone(),
            kind: options.kind,
            status: ProcessStatus::Running,
            prompt_preview: prompt_preview(prompt),
            full_prompt: prompt.to_string(),
            result: None,
            structured_result: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            parent_process_id: options.parent_process_id.clone(),
            metadata: options.metadata,
            group_metadata,
            sdk_session_id: None,
            backend: options.backend,
            working_directory: options.working_directory,
            raw_stdout_file_path: options.raw_stdout_file_path,
            result_file_path: options.result_file_path,
        };

        {
            let mut state = lock_unpoisoned(&self.inner.state);
            if let Some(parent_id) = &options.parent_process_id {
                if let Some(parent) = state.get_mut(parent_id) {
                    if let Some(group) = parent.group_metadata.as_mut() {
                        if !group.child_process_ids.contains(&id) {
                            group.child_process_ids.push(id.clone());
                        }
                        let parent_snapshot = parent.clone();
                        let _ = self.inner.events.send(ProcessEvent::Updated(parent_snapshot));
                    }
                }
            }
            state.insert(id.clone(), record.clone());
            let _ = self.inner.events.send(ProcessEvent::Added(record));
        }
        self.schedule_save();
        id
    }

    /// Links an existing child to an existing group; returns false when
    /// either side is unknown or the parent is not a group.
    pub fn attach_child(&self, parent_id: &str, child_id: &str) -> bool {
        let attached = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let parent_is_group = state
                .get(parent_id)
                .map(|parent| parent.group_metadata.is_some())
                .unwrap_or(false);
            if !parent_is_group || !state.contains_key(child_id) {
                false
            } else {
                let parent_snapshot = {
                    let parent = state.get_mut(parent_id).expect("parent checked above");
                    let group = parent
                        .group_metadata
                        .as_mut()
                        .expect("group metadata checked above");
                    if !group.child_process_ids.iter().any(|id| id == child_id) {
                        group.child_process_ids.push(child_id.to_string());
                    }
                    parent.clone()
                };
                let child_snapshot = {
                    let child = state.get_mut(child_id).expect("child checked above");
                    child.parent_process_id = Some(parent_id.to_string());
                    child.clone()
                };
                let _ = self.inner.events.send(ProcessEvent::Updated(child_snapshot));
                let _ = self
                    .inner
                    .events
                    .send(ProcessEvent::Updated(parent_snapshot));
                true
            }
        };
        if attached {
            self.schedule_save();
        }
        attached
    }

    /// Transitions a running process. Unknown ids are ignored; transitions
    /// out of a terminal state are rejected; `end_time` is set exactly on
    /// the terminal transition.
    pub fn update(
        &self,
        id: &str,
        status: ProcessStatus,
        result: Option<String>,
        error: Option<String>,
    ) {
        let mutated = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let Some(record) = state.get_mut(id) else {
                return;
            };
            if record.status.is_terminal() || !status.is_terminal() {
                return;
            }
            record.status = status;
            if result.is_some() {
                record.result = result;
            }
            if error.is_some() {
                record.error = error;
            }
            record.end_time = Some(Utc::now());
            let _ = self.inner.events.send(ProcessEvent::Updated(record.clone()));
            true
        };
        if mutated {
            self.schedule_save();
        }
    }

    pub fn complete(&self, id: &str, result: Option<String>) {
        self.update(id, ProcessStatus::Completed, result, None);
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) {
        self.update(id, ProcessStatus::Failed, None, Some(error.into()));
    }

    /// Cancels a process. For a group, every running child is cancelled
    /// first — each with the "parent cancelled" reason — then the group
    /// itself, so listeners observe children before the parent.
    pub fn cancel(&self, id: &str) {
        let mutated = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let child_ids = match state.get(id) {
                Some(record) if record.status == ProcessStatus::Running => record
                    .group_metadata
                    .as_ref()
                    .map(|group| group.child_process_ids.clone())
                    .unwrap_or_default(),
                _ => return,
            };

            let now = Utc::now();
            for child_id in child_ids {
                if let Some(child) = state.get_mut(&child_id) {
                    if child.status == ProcessStatus::Running {
                        child.status = ProcessStatus::Cancelled;
                        child.error = Some("parent cancelled".to_string());
                        child.end_time = Some(now);
                        let _ = self.inner.events.send(ProcessEvent::Updated(child.clone()));
                    }
                }
            }

            let record = state.get_mut(id).expect("record presence checked above");
            record.status = ProcessStatus::Cancelled;
            record.end_time = Some(now);
            let _ = self.inner.events.send(ProcessEvent::Updated(record.clone()));
            true
        };
        if mutated {
            self.schedule_save();
        }
    }

    /// Records the SDK session id that makes a completed run resumable.
    pub fn attach_sdk_session_id(&self, id: &str, session_id: impl Into<String>) {
        self.attach_session_metadata(
            id,
            SessionMetadata {
                sdk_session_id: Some(session_id.into()),
                ..SessionMetadata::default()
            },
        );
    }

    /// Merges session-resume fields onto an existing record.
    pub fn attach_session_metadata(&self, id: &str, metadata: SessionMetadata) {
        let mutated = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let Some(record) = state.get_mut(id) else {
                return;
            };
            if let Some(session_id) = metadata.sdk_session_id {
                record.sdk_session_id = Some(session_id);
            }
            if let Some(backend) = metadata.backend {
                record.backend = Some(backend);
            }
            if let Some(working_directory) = metadata.working_directory {
                record.working_directory = Some(working_directory);
            }
            let _ = self.inner.events.send(ProcessEvent::Updated(record.clone()));
            true
        };
        if mutated {
            self.schedule_save();
        }
    }

    pub fn get_session_metadata(&self, id: &str) -> Option<SessionMetadata> {
        let state = lock_unpoisoned(&self.inner.state);
        state.get(id).map(|record| SessionMetadata {
            sdk_session_id: record.sdk_session_id.clone(),
            backend: record.backend,
            working_directory: record.working_directory.clone(),
        })
    }

    pub fn is_resumable(&self, id: &str) -> bool {
        let state = lock_unpoisoned(&self.inner.state);
        state
            .get(id)
            .map(ProcessRecord::is_resumable)
            .unwrap_or(false)
    }

    pub fn get(&self, id: &str) -> Option<ProcessRecord> {
        lock_unpoisoned(&self.inner.state).get(id).cloned()
    }

    /// All records, newest first.
    pub fn all(&self) -> Vec<ProcessRecord> {
        let state = lock_unpoisoned(&self.inner.state);
        let mut records: Vec<ProcessRecord> = state.values().cloned().collect();
        records.sort_by(|left, right| {
            right
                .start_time
                .cmp(&left.start_time)
                .then_with(|| left.id.cmp(&right.id))
        });
        records
    }

    pub fn running(&self) -> Vec<ProcessRecord> {
        self.all()
            .into_iter()
            .filter(|record| record.status == ProcessStatus::Running)
            .collect()
    }

    /// Records without a parent link, newest first.
    pub fn top_level(&self) -> Vec<ProcessRecord> {
        self.all()
            .into_iter()
            .filter(|record| record.parent_process_id.is_none())
            .collect()
    }

    /// Children of a group, in the group's attachment order.
    pub fn children(&self, group_id: &str) -> Vec<ProcessRecord> {
        let state = lock_unpoisoned(&self.inner.state);
        let Some(group) = state
            .get(group_id)
            .and_then(|record| record.group_metadata.as_ref())
        else {
            return Vec::new();
        };
        group
            .child_process_ids
            .iter()
            .filter_map(|child_id| state.get(child_id).cloned())
            .collect()
    }

    pub fn counts(&self) -> ProcessCounts {
        let state = lock_unpoisoned(&self.inner.state);
        let mut counts = ProcessCounts::default();
        for record in state.values() {
            counts.total += 1;
            match record.status {
                ProcessStatus::Running => counts.running += 1,
                ProcessStatus::Completed => counts.completed += 1,
                ProcessStatus::Failed => counts.failed += 1,
                ProcessStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn has_running(&self) -> bool {
        let state = lock_unpoisoned(&self.inner.state);
        state
            .values()
            .any(|record| record.status == ProcessStatus::Running)
    }

    /// Deletes a record and scrubs its id from any group child list.
    pub fn remove(&self, id: &str) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            let Some(removed) = state.remove(id) else {
                return;
            };
            for record in state.values_mut() {
                if let Some(group) = record.group_metadata.as_mut() {
                    group.child_process_ids.retain(|child_id| child_id != id);
                }
                if record.parent_process_id.as_deref() == Some(id) {
                    record.parent_process_id = None;
                }
            }
            let _ = self.inner.events.send(ProcessEvent::Removed(removed));
        }
        self.schedule_save();
    }

    /// Removes every terminal record.
    pub fn clear_completed(&self) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            let terminal_ids: Vec<String> = state
                .values()
                .filter(|record| record.status.is_terminal())
                .map(|record| record.id.clone())
                .collect();
            for id in terminal_ids {
                if let Some(removed) = state.remove(&id) {
                    let _ = self.inner.events.send(ProcessEvent::Removed(removed));
                }
            }
        }
        self.schedule_save();
    }

    pub fn clear_all(&self) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.clear();
            let _ = self.inner.events.send(ProcessEvent::Cleared);
        }
        self.schedule_save();
    }

    /// Flushes any pending save synchronously.
    pub fn dispose(&self) {
        self.inner.debouncer.flush();
    }

    fn schedule_save(&self) {
        if self.inner.store.is_none() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.debouncer.schedule(move || {
            let snapshot = lock_unpoisoned(&inner.state).clone();
            if let Some(store) = &inner.store {
                if let Err(error) = store.save(&snapshot) {
                    warn!("process registry save failed: {error}");
                }
            }
        });
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
