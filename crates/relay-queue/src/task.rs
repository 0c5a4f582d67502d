use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known task kinds; callers may define their own tags.
pub const TASK_KIND_FOLLOW_PROMPT: &str = "follow-prompt";
pub const TASK_KIND_CLARIFICATION: &str = "ai-clarification";

/// Scheduling class of a task. Within a class, tasks start in enqueue
/// order; across classes, `high` always starts before `normal` and `low`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Classes in scheduling order, highest first.
    pub const ALL: [TaskPriority; 3] = [Self::High, Self::Normal, Self::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub(crate) fn class_index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Backend inputs carried by a task, tagged by prompt source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaskPayload {
    /// Prompt text lives in a file read at execution time.
    #[serde(rename_all = "camelCase")]
    PromptFile {
        prompt_file: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skill: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    /// Prompt text carried inline.
    #[serde(rename_all = "camelCase")]
    InlinePrompt {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skill: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
}

impl Default for TaskPayload {
    fn default() -> Self {
        Self::InlinePrompt {
            content: String::new(),
            working_directory: None,
            skill: None,
            model: None,
            context: None,
        }
    }
}

impl TaskPayload {
    pub fn inline(content: impl Into<String>) -> Self {
        Self::InlinePrompt {
            content: content.into(),
            working_directory: None,
            skill: None,
            model: None,
            context: None,
        }
    }

    pub fn working_directory(&self) -> Option<&Path> {
        match self {
            Self::PromptFile {
                working_directory, ..
            }
            | Self::InlinePrompt {
                working_directory, ..
            } => working_directory.as_deref(),
        }
    }

    pub fn skill(&self) -> Option<&str> {
        match self {
            Self::PromptFile { skill, .. } | Self::InlinePrompt { skill, .. } => skill.as_deref(),
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            Self::PromptFile { model, .. } | Self::InlinePrompt { model, .. } => model.as_deref(),
        }
    }

    /// Produces the prompt text to send: inline content as-is, file
    /// payloads read from disk at execution time.
    pub fn resolve_prompt(&self) -> Result<String> {
        match self {
            Self::InlinePrompt { content, .. } => Ok(content.clone()),
            Self::PromptFile { prompt_file, .. } => std::fs::read_to_string(prompt_file)
                .with_context(|| format!("failed to read prompt file {}", prompt_file.display())),
        }
    }
}

/// Per-task execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A unit of AI work scheduled through the queue. Serialized in camelCase
/// with millisecond timestamps; this shape is what `queue.json` stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    #[serde(default)]
    pub config: TaskConfig,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Back-reference to the registry process created on execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
}

/// Caller input for enqueueing a task.
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    pub kind: String,
    pub priority: Option<TaskPriority>,
    pub payload: TaskPayload,
    pub config: TaskConfig,
    pub display_name: Option<String>,
}

/// Counts by status plus the pause flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub is_paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventKind {
    Enqueued,
    Started,
    Completed,
    Failed,
    Cancelled,
    /// A running task was asked to cancel; the executor propagates this
    /// into the backend and the terminal `Cancelled` event follows.
    CancelRequested,
    Reordered,
    Paused,
    Resumed,
    Cleared,
}

/// Change notification emitted by the queue manager.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    pub task_id: Option<String>,
    pub task: Option<Task>,
}

impl QueueEvent {
    pub(crate) fn bare(kind: QueueEventKind) -> Self {
        Self {
            kind,
            task_id: None,
            task: None,
        }
    }

    pub(crate) fn for_task(kind: QueueEventKind, task: &Task) -> Self {
        Self {
            kind,
            task_id: Some(task.id.clone()),
            task: Some(task.clone()),
        }
    }
}
