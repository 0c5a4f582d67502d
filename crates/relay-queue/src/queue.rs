use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tokio::sync::broadcast;

use relay_core::current_unix_timestamp_ms;

use crate::task::{
    QueueEvent, QueueEventKind, QueueStats, Task, TaskInput, TaskPriority, TaskStatus,
};

const TASK_ID_PREFIX: &str = "task";
const EVENT_CHANNEL_CAPACITY: usize = 256;

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> String {
    let now = current_unix_timestamp_ms();
    let suffix = TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{TASK_ID_PREFIX}-{now}-{suffix:04}")
}

/// Queue behavior knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskQueueConfig {
    pub default_priority: TaskPriority,
    /// 0 means unbounded.
    pub max_queue_size: usize,
    pub keep_history: bool,
    pub max_history_size: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            default_priority: TaskPriority::Normal,
            max_queue_size: 0,
            keep_history: true,
            max_history_size: 100,
        }
    }
}

#[derive(Default)]
struct QueueState {
    /// One FIFO per priority class, indexed by `TaskPriority::class_index`.
    classes: [VecDeque<Task>; 3],
    running: Vec<Task>,
    history: VecDeque<Task>,
    paused: bool,
}

impl QueueState {
    fn queued_count(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    stats_events: broadcast::Sender<QueueStats>,
    config: TaskQueueConfig,
}

/// Ordered multiset of pending tasks across three FIFO priority classes.
///
/// `peek_next` always returns the oldest task of the highest non-empty
/// class. Reorder operations act within a class only. All mutations emit
/// change events in mutation order.
#[derive(Clone)]
pub struct TaskQueueManager {
    inner: Arc<QueueInner>,
}

impl TaskQueueManager {
    pub fn new(config: TaskQueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (stats_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                events,
                stats_events,
                config,
            }),
        }
    }

    pub fn config(&self) -> TaskQueueConfig {
        self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Stats snapshots, one per change event.
    pub fn subscribe_stats(&self) -> broadcast::Receiver<QueueStats> {
        self.inner.stats_events.subscribe()
    }

    /// Adds a task with a fresh id; fails when the queue is at capacity.
    pub fn enqueue(&self, input: TaskInput) -> Result<String> {
        self.enqueue_with_created_at(input, current_unix_timestamp_ms())
    }

    /// Adds several tasks atomically: either all fit under the size cap or
    /// none are enqueued.
    pub fn enqueue_batch(&self, inputs: Vec<TaskInput>) -> Result<Vec<String>> {
        {
            let state = lock_unpoisoned(&self.inner.state);
            let cap = self.inner.config.max_queue_size;
            if cap > 0 && state.queued_count() + inputs.len() > cap {
                bail!("queue is full (max {cap} tasks)");
            }
        }
        let mut ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            ids.push(self.enqueue(input)?);
        }
        Ok(ids)
    }

    /// Re-adds a restored pending task under a fresh id, keeping its
    /// original creation time so FIFO order survives a restart.
    pub(crate) fn enqueue_with_created_at(
        &self,
        input: TaskInput,
        created_at: u64,
    ) -> Result<String> {
        let priority = input.priority.unwrap_or(self.inner.config.default_priority);
        let task = Task {
            id: next_task_id(),
            kind: input.kind,
            priority,
            payload: input.payload,
            config: input.config,
            status: TaskStatus::Queued,
            display_name: input.display_name,
            created_at,
            started_at: None,
            completed_at: None,
            error: None,
            process_id: None,
        };

        let id = task.id.clone();
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            let cap = self.inner.config.max_queue_size;
            if cap > 0 && state.queued_count() >= cap {
                bail!("queue is full (max {cap} tasks)");
            }
            state.classes[priority.class_index()].push_back(task.clone());
            self.emit(&state, QueueEvent::for_task(QueueEventKind::Enqueued, &task));
        }
        Ok(id)
    }

    /// The task that would start next: the oldest entry of the highest
    /// non-empty priority class.
    pub fn peek_next(&self) -> Option<Task> {
        let state = lock_unpoisoned(&self.inner.state);
        state
            .classes
            .iter()
            .find_map(|class| class.front().cloned())
    }

    /// Transitions a queued task to running, recording its start time.
    pub fn mark_started(&self, id: &str) -> Option<Task> {
        let mut state = lock_unpoisoned(&self.inner.state);
        let (class_index, position) = find_queued(&state, id)?;
        let mut task = state.classes[class_index].remove(position)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(current_unix_timestamp_ms());
        state.running.push(task.clone());
        self.emit(&state, QueueEvent::for_task(QueueEventKind::Started, &task));
        Some(task)
    }

    pub fn mark_completed(&self, id: &str) -> Option<Task> {
        self.finish(id, TaskStatus::Completed, None, QueueEventKind::Completed)
    }

    pub fn mark_failed(&self, id: &str, error: impl Into<String>) -> Option<Task> {
        self.finish(
            id,
            TaskStatus::Failed,
            Some(error.into()),
            QueueEventKind::Failed,
        )
    }

    pub fn mark_cancelled(&self, id: &str) -> Option<Task> {
        self.finish(id, TaskStatus::Cancelled, None, QueueEventKind::Cancelled)
    }

    /// Cancels a task. Queued tasks transition immediately; running tasks
    /// get a cancel-requested signal that the executor propagates to the
    /// backend before the terminal transition. Returns false for unknown
    /// or already-terminal tasks.
    pub fn cancel(&self, id: &str) -> bool {
        let queued = {
            let state = lock_unpoisoned(&self.inner.state);
            find_queued(&state, id).is_some()
        };
        if queued {
            return self.mark_cancelled(id).is_some();
        }

        let state = lock_unpoisoned(&self.inner.state);
        if let Some(task) = state.running.iter().find(|task| task.id == id) {
            let event = QueueEvent::for_task(QueueEventKind::CancelRequested, task);
            self.emit(&state, event);
            return true;
        }
        false
    }

    /// Moves a queued task to the head of its priority class.
    pub fn move_to_top(&self, id: &str) -> bool {
        self.reorder(id, |position, _len| (position > 0).then_some(0))
    }

    /// Swaps a queued task with its predecessor in the same class.
    pub fn move_up(&self, id: &str) -> bool {
        self.reorder(id, |position, _len| position.checked_sub(1))
    }

    /// Swaps a queued task with its successor in the same class.
    pub fn move_down(&self, id: &str) -> bool {
        self.reorder(id, |position, len| {
            (position + 1 < len).then_some(position + 1)
        })
    }

    /// Removes all queued tasks; running tasks are untouched.
    pub fn clear(&self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        let had_queued = state.queued_count() > 0;
        for class in &mut state.classes {
            class.clear();
        }
        if had_queued {
            self.emit(&state, QueueEvent::bare(QueueEventKind::Cleared));
        }
    }

    pub fn pause(&self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if !state.paused {
            state.paused = true;
            self.emit(&state, QueueEvent::bare(QueueEventKind::Paused));
        }
    }

    pub fn resume(&self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if state.paused {
            state.paused = false;
            self.emit(&state, QueueEvent::bare(QueueEventKind::Resumed));
        }
    }

    pub fn is_paused(&self) -> bool {
        lock_unpoisoned(&self.inner.state).paused
    }

    /// 1-based position among all queued tasks, high class first; 0 when
    /// the task is not queued.
    pub fn get_position(&self, id: &str) -> usize {
        let state = lock_unpoisoned(&self.inner.state);
        let mut position = 0;
        for class in &state.classes {
            for task in class {
                position += 1;
                if task.id == id {
                    return position;
                }
            }
        }
        0
    }

    pub fn stats(&self) -> QueueStats {
        stats_of(&lock_unpoisoned(&self.inner.state))
    }

    /// All queued tasks in scheduling order.
    pub fn get_queued(&self) -> Vec<Task> {
        let state = lock_unpoisoned(&self.inner.state);
        state
            .classes
            .iter()
            .flat_map(|class| class.iter().cloned())
            .collect()
    }

    pub fn get_running(&self) -> Vec<Task> {
        lock_unpoisoned(&self.inner.state).running.clone()
    }

    /// Terminal tasks, oldest first, bounded by the history size.
    pub fn get_history(&self) -> Vec<Task> {
        let state = lock_unpoisoned(&self.inner.state);
        state.history.iter().cloned().collect()
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        let state = lock_unpoisoned(&self.inner.state);
        state
            .classes
            .iter()
            .flat_map(|class| class.iter())
            .chain(state.running.iter())
            .chain(state.history.iter())
            .find(|task| task.id == id)
            .cloned()
    }

    /// Links the task to the registry process created for its execution.
    pub fn set_process_id(&self, id: &str, process_id: impl Into<String>) {
        let mut state = lock_unpoisoned(&self.inner.state);
        let process_id = process_id.into();
        let QueueState { running, classes, .. } = &mut *state;
        for task in running
            .iter_mut()
            .chain(classes.iter_mut().flat_map(|class| class.iter_mut()))
        {
            if task.id == id {
                task.process_id = Some(process_id);
                return;
            }
        }
    }

    /// Restores a terminal task verbatim into history (used by the
    /// persistence layer; emits no event).
    pub(crate) fn restore_history_entry(&self, task: Task) {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.history.push_back(task);
        let max = self.inner.config.max_history_size.max(1);
        while state.history.len() > max {
            state.history.pop_front();
        }
    }

    /// Pending tasks (queued in scheduling order, then running) plus
    /// history, for snapshotting.
    pub(crate) fn snapshot_parts(&self) -> (Vec<Task>, Vec<Task>) {
        let state = lock_unpoisoned(&self.inner.state);
        let mut pending: Vec<Task> = state
            .classes
            .iter()
            .flat_map(|class| class.iter().cloned())
            .collect();
        pending.extend(state.running.iter().cloned());
        (pending, state.history.iter().cloned().collect())
    }

    fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
        event: QueueEventKind,
    ) -> Option<Task> {
        let mut state = lock_unpoisoned(&self.inner.state);
        let mut task = if let Some(position) = state.running.iter().position(|task| task.id == id)
        {
            state.running.remove(position)
        } else if let Some((class_index, position)) = find_queued(&state, id) {
            state.classes[class_index].remove(position)?
        } else {
            return None;
        };

        task.status = status;
        task.completed_at = Some(current_unix_timestamp_ms());
        task.error = error;

        if self.inner.config.keep_history {
            state.history.push_back(task.clone());
            let max = self.inner.config.max_history_size.max(1);
            while state.history.len() > max {
                state.history.pop_front();
            }
        }
        self.emit(&state, QueueEvent::for_task(event, &task));
        Some(task)
    }

    fn reorder<F>(&self, id: &str, target: F) -> bool
    where
        F: FnOnce(usize, usize) -> Option<usize>,
    {
        let mut state = lock_unpoisoned(&self.inner.state);
        let Some((class_index, position)) = find_queued(&state, id) else {
            return false;
        };
        let class = &mut state.classes[class_index];
        let Some(new_position) = target(position, class.len()) else {
            return false;
        };
        if new_position == position {
            return false;
        }
        let Some(task) = class.remove(position) else {
            return false;
        };
        class.insert(new_position, task.clone());
        self.emit(&state, QueueEvent::for_task(QueueEventKind::Reordered, &task));
        true
    }

    fn emit(&self, state: &QueueState, event: QueueEvent) {
        let _ = self.inner.events.send(event);
        let _ = self.inner.stats_events.send(stats_of(state));
    }
}

fn stats_of(state: &QueueState) -> QueueStats {
    let mut stats = QueueStats {
        queued: state.queued_count(),
        running: state.running.len(),
        is_paused: state.paused,
        ..QueueStats::default()
    };
    for task in &state.history {
        match task.status {
            TaskStatus::Completed => stats.completed += 1,
            TaskStatus::Failed => stats.failed += 1,
            TaskStatus::Cancelled => stats.cancelled += 1,
            TaskStatus::Queued | TaskStatus::Running => {}
        }
    }
    stats
}

fn find_queued(state: &QueueState, id: &str) -> Option<(usize, usize)> {
    for (class_index, class) in state.classes.iter().enumerate() {
        if let Some(position) = class.iter().position(|task| task.id == id) {
            return Some((class_index, position));
        }
    }
    None
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
