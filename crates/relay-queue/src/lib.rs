//! Priority-ordered task queue and execution engine for AI invocations.
//!
//! The [`TaskQueueManager`] owns pending tasks across three FIFO priority
//! classes, the [`QueuePersistence`] layer snapshots them to disk with
//! crash-recovery semantics, and the [`QueueExecutor`] drives tasks under a
//! concurrency cap, bridging results into the process registry.

pub mod executor;
pub mod persistence;
pub mod queue;
pub mod task;

pub use executor::{QueueExecutor, QueueExecutorConfig};
pub use persistence::{QueuePersistence, QueuePersistenceConfig, QueueSnapshot};
pub use queue::{TaskQueueConfig, TaskQueueManager};
pub use task::{
    QueueEvent, QueueEventKind, QueueStats, Task, TaskConfig, TaskInput, TaskPayload,
    TaskPriority, TaskStatus, TASK_KIND_CLARIFICATION, TASK_KIND_FOLLOW_PROMPT,
};
