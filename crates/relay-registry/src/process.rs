use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_backend::BackendKind;

const PROMPT_PREVIEW_MAX_CHARS: usize = 120;

/// Lifecycle states of a tracked process. Terminal states are final:
/// any later transition attempt is rejected by the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Present on group processes; children are stored by id only, with the
/// registry as the single source of truth for the linked records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    #[serde(default)]
    pub child_process_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
}

/// One tracked AI invocation, serialized in camelCase with ISO timestamps
/// so the persisted map and the dashboard sync bodies share a shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ProcessStatus,
    pub prompt_preview: String,
    pub full_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_metadata: Option<GroupMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_stdout_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file_path: Option<PathBuf>,
}

impl ProcessRecord {
    pub fn is_group(&self) -> bool {
        self.group_metadata.is_some()
    }

    /// A completed SDK invocation with a recorded session id can be resumed.
    pub fn is_resumable(&self) -> bool {
        self.status == ProcessStatus::Completed
            && self.backend == Some(BackendKind::Sdk)
            && self.sdk_session_id.is_some()
    }
}

/// Caller-supplied options for registering a process.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Free-form tag, e.g. `queue-follow-prompt` or `code-review-group`.
    pub kind: String,
    pub parent_process_id: Option<String>,
    pub metadata: Option<Value>,
    pub backend: Option<BackendKind>,
    pub working_directory: Option<PathBuf>,
    pub raw_stdout_file_path: Option<PathBuf>,
    pub result_file_path: Option<PathBuf>,
}

/// Session-resume bookkeeping attached to a process after an SDK run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub sdk_session_id: Option<String>,
    pub backend: Option<BackendKind>,
    pub working_directory: Option<PathBuf>,
}

/// Counts by status over all tracked processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessCounts {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

/// Change notifications carrying a snapshot of the affected record.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Added(ProcessRecord),
    Updated(ProcessRecord),
    Removed(ProcessRecord),
    Cleared,
}

/// Collapses a prompt to a short single-line preview.
pub fn prompt_preview(prompt: &str) -> String {
    let single_line = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= PROMPT_PREVIEW_MAX_CHARS {
        return single_line;
    }
    single_line
        .chars()
        .take(PROMPT_PREVIEW_MAX_CHARS)
        .collect::<String>()
        + "..."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_prompt_preview_collapses_whitespace_and_truncates() {
        assert_eq!(prompt_preview("hello\n  world"), "hello world");
        let long = "x".repeat(400);
        let preview = prompt_preview(&long);
        assert_eq!(preview.chars().count(), PROMPT_PREVIEW_MAX_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn unit_process_record_serializes_camel_case_with_type_tag() {
        let record = ProcessRecord {
            id: "proc-1".to_string(),
            kind: "queue-follow-prompt".to_string(),
            status: ProcessStatus::Running,
            prompt_preview: "p".to_string(),
            full_prompt: "p".to_string(),
            result: None,
            structured_result: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            parent_process_id: None,
            metadata: None,
            group_metadata: None,
            sdk_session_id: None,
            backend: None,
            working_directory: None,
            raw_stdout_file_path: None,
            result_file_path: None,
        };
        let encoded = serde_json::to_value(&record).expect("encode");
        assert_eq!(encoded["type"], "queue-follow-prompt");
        assert_eq!(encoded["status"], "running");
        assert!(encoded["promptPreview"].is_string());
        assert!(encoded["startTime"].is_string());
        assert!(encoded.get("endTime").is_none());
    }

    #[test]
    fn unit_resumable_requires_completed_sdk_run_with_session_id() {
        let mut record = ProcessRecord {
            id: "proc-1".to_string(),
            kind: "clarification".to_string(),
            status: ProcessStatus::Completed,
            prompt_preview: String::new(),
            full_prompt: String::new(),
            result: None,
            structured_result: None,
            error: None,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            parent_process_id: None,
            metadata: None,
            group_metadata: None,
            sdk_session_id: Some("sess-1".to_string()),
            backend: Some(BackendKind::Sdk),
            working_directory: None,
            raw_stdout_file_path: None,
            result_file_path: None,
        };
        assert!(record.is_resumable());

        record.backend = Some(BackendKind::Cli);
        assert!(!record.is_resumable());

        record.backend = Some(BackendKind::Sdk);
        record.status = ProcessStatus::Failed;
        assert!(!record.is_resumable());
    }
}
