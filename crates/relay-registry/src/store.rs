use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use relay_core::write_text_atomic;

use crate::process::ProcessRecord;

/// File-backed key-value store for the process map: one JSON object of
/// `processId -> record`, written atomically and pruned on save.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    history_limit: usize,
}

impl RegistryStore {
    pub fn new(data_dir: &Path, history_limit: usize) -> Self {
        Self {
            path: data_dir.join("process-registry.json"),
            history_limit: history_limit.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted map. A missing or unreadable file yields an
    /// empty map; corruption is logged, never propagated.
    pub fn load(&self) -> HashMap<String, ProcessRecord> {
        if !self.path.exists() {
            return HashMap::new();
        }
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(
                    "failed to read process registry {}: {error}",
                    self.path.display()
                );
                return HashMap::new();
            }
        };
        match serde_json::from_str::<HashMap<String, ProcessRecord>>(&raw) {
            Ok(records) => records,
            Err(error) => {
                warn!(
                    "discarding unparseable process registry {}: {error}",
                    self.path.display()
                );
                HashMap::new()
            }
        }
    }

    /// Persists the map, dropping the oldest terminal records beyond the
    /// history limit. Running records are always kept so crash recovery
    /// can mark them failed.
    pub fn save(&self, records: &HashMap<String, ProcessRecord>) -> Result<()> {
        let pruned = prune_to_limit(records, self.history_limit);
        let ordered: BTreeMap<&str, &ProcessRecord> = pruned
            .iter()
            .map(|record| (record.id.as_str(), *record))
            .collect();
        let mut payload =
            serde_json::to_string_pretty(&ordered).context("failed to encode process registry")?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

fn prune_to_limit(records: &HashMap<String, ProcessRecord>, limit: usize) -> Vec<&ProcessRecord> {
    let mut kept: Vec<&ProcessRecord> = records
        .values()
        .filter(|record| !record.status.is_terminal())
        .collect();
    let mut terminal: Vec<&ProcessRecord> = records
        .values()
        .filter(|record| record.status.is_terminal())
        .collect();
    terminal.sort_by(|left, right| {
        let left_at = left.end_time.unwrap_or(left.start_time);
        let right_at = right.end_time.unwrap_or(right.start_time);
        right_at.cmp(&left_at).then_with(|| left.id.cmp(&right.id))
    });
    let room = limit.saturating_sub(kept.len());
    terminal.truncate(room);
    kept.extend(terminal);
    kept
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::process::{ProcessStatus, RegisterOptions};
    use crate::registry::{ProcessRegistry, ProcessRegistryConfig};

    fn record(id: &str, status: ProcessStatus, age_minutes: i64) -> ProcessRecord {
        let start_time = Utc::now() - Duration::minutes(age_minutes);
        ProcessRecord {
            id: id.to_string(),
            kind: "test".to_string(),
            status,
            prompt_preview: String::new(),
            full_prompt: String::new(),
            result: None,
            structured_result: None,
            error: None,
            start_time,
            end_time: status.is_terminal().then_some(start_time),
            parent_process_id: None,
            metadata: None,
            group_metadata: None,
            sdk_session_id: None,
            backend: None,
            working_directory: None,
            raw_stdout_file_path: None,
            result_file_path: None,
        }
    }

    #[test]
    fn functional_save_and_load_round_trips_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path(), 100);
        let mut records = HashMap::new();
        records.insert("a".to_string(), record("a", ProcessStatus::Completed, 5));
        records.insert("b".to_string(), record("b", ProcessStatus::Running, 1));

        store.save(&records).expect("save");
        let restored = store.load();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored["a"].status, ProcessStatus::Completed);
        assert_eq!(restored["b"].status, ProcessStatus::Running);
        assert!(!dir.path().join("process-registry.json.tmp").exists());
    }

    #[test]
    fn unit_load_tolerates_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path(), 100);
        assert!(store.load().is_empty());

        std::fs::write(store.path(), "{ not valid json !!!").expect("write corrupt");
        assert!(store.load().is_empty());
    }

    #[test]
    fn regression_save_prunes_oldest_terminal_but_keeps_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path(), 3);
        let mut records = HashMap::new();
        records.insert("run".to_string(), record("run", ProcessStatus::Running, 60));
        for (ordinal, age) in [(1, 50), (2, 40), (3, 30), (4, 20)] {
            let id = format!("done-{ordinal}");
            records.insert(id.clone(), record(&id, ProcessStatus::Completed, age));
        }

        store.save(&records).expect("save");
        let restored = store.load();
        assert_eq!(restored.len(), 3);
        assert!(restored.contains_key("run"));
        assert!(restored.contains_key("done-4"));
        assert!(restored.contains_key("done-3"));
        assert!(!restored.contains_key("done-1"));
    }

    #[test]
    fn integration_registry_restore_marks_running_as_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RegistryStore::new(dir.path(), 100);
        let mut records = HashMap::new();
        records.insert(
            "interrupted".to_string(),
            record("interrupted", ProcessStatus::Running, 10),
        );
        store.save(&records).expect("seed");

        let registry = ProcessRegistry::with_store(store, ProcessRegistryConfig::default());
        registry.restore();

        let restored = registry.get("interrupted").expect("record");
        assert_eq!(restored.status, ProcessStatus::Failed);
        assert!(restored
            .error
            .expect("error")
            .contains("restarted while process was running"));
        assert!(restored.end_time.is_some());

        // A freshly registered process is unaffected by restore semantics.
        let id = registry.register(
            "new work",
            RegisterOptions {
                kind: "test".to_string(),
                ..RegisterOptions::default()
            },
        );
        assert_eq!(
            registry.get(&id).expect("new record").status,
            ProcessStatus::Running
        );
    }
}
