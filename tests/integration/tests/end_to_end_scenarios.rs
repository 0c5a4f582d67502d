//! End-to-end scenarios across the queue engine, registry, persistence,
//! and backend fallback chain.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use relay_backend::{
    BackendError, SdkAvailability, SdkClient, SdkReply, SdkSendRequest, SdkSession,
};
use relay_queue::{
    QueuePersistence, QueuePersistenceConfig, TaskInput, TaskPayload, TaskPriority,
    TaskQueueConfig, TaskQueueManager, TaskStatus,
};
use relay_registry::{
    ProcessEvent, ProcessRegistry, ProcessRegistryConfig, ProcessStatus, RegisterOptions,
};
use relay_service::{QueueService, RelayConfig};

struct EchoSession {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SdkSession for EchoSession {
    fn id(&self) -> &str {
        "sess-echo"
    }

    async fn send(&self, request: SdkSendRequest) -> Result<SdkReply, BackendError> {
        self.order
            .lock()
            .expect("order lock")
            .push(request.prompt.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(SdkReply {
            response: format!("echo: {}", request.prompt),
            session_id: Some("sess-echo".to_string()),
        })
    }

    async fn close(&self) {}
}

#[derive(Clone, Default)]
struct EchoSdk {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SdkClient for EchoSdk {
    async fn availability(&self) -> SdkAvailability {
        SdkAvailability::available()
    }

    async fn open_session(
        &self,
        _working_directory: Option<&Path>,
    ) -> Result<Arc<dyn SdkSession>, BackendError> {
        Ok(Arc::new(EchoSession {
            order: Arc::clone(&self.order),
        }))
    }

    async fn abort(&self, _session_id: &str) {}
}

struct UnavailableSdk;

#[async_trait]
impl SdkClient for UnavailableSdk {
    async fn availability(&self) -> SdkAvailability {
        SdkAvailability::unavailable("no auth")
    }

    async fn open_session(
        &self,
        _working_directory: Option<&Path>,
    ) -> Result<Arc<dyn SdkSession>, BackendError> {
        Err(BackendError::Unavailable("no auth".to_string()))
    }

    async fn abort(&self, _session_id: &str) {}
}

fn config_for(dir: &Path) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.data_dir = Some(dir.to_path_buf());
    config.persistence.debounce_ms = 30;
    config.registry.debounce_ms = 30;
    config
}

fn follow_prompt(name: &str, priority: TaskPriority) -> TaskInput {
    TaskInput {
        kind: "follow-prompt".to_string(),
        priority: Some(priority),
        payload: TaskPayload::inline(name),
        display_name: Some(name.to_string()),
        ..TaskInput::default()
    }
}

async fn wait_for<F: Fn() -> bool>(check: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_priority_ordering_starts_high_before_earlier_normal_and_low() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sdk = EchoSdk::default();
    let order = Arc::clone(&sdk.order);
    let service = QueueService::new(config_for(dir.path()), Arc::new(sdk)).expect("service");
    service.start();

    // All three are queued before anything may start.
    service.queue().pause();
    service
        .queue()
        .enqueue(follow_prompt("T1", TaskPriority::Normal))
        .expect("T1");
    service
        .queue()
        .enqueue(follow_prompt("T2", TaskPriority::Low))
        .expect("T2");
    service
        .queue()
        .enqueue(follow_prompt("T3", TaskPriority::High))
        .expect("T3");
    service.queue().resume();

    wait_for(|| service.queue().get_history().len() == 3, "three finishes").await;
    service.dispose();

    assert_eq!(order.lock().expect("order").as_slice(), ["T3", "T1", "T2"]);
    let history = service.queue().get_history();
    assert!(history
        .iter()
        .all(|task| task.status == TaskStatus::Completed));
    let finished: Vec<&str> = history
        .iter()
        .map(|task| task.display_name.as_deref().expect("name"))
        .collect();
    assert_eq!(finished, ["T3", "T1", "T2"]);
}

#[tokio::test]
async fn scenario_restart_recovery_reenqueues_queued_and_fails_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let snapshot = json!({
        "version": 1,
        "savedAt": "2026-01-01T00:00:00Z",
        "pending": [
            {
                "id": "q1",
                "type": "follow-prompt",
                "priority": "high",
                "payload": {"type": "inline-prompt", "content": "queued work"},
                "status": "queued",
                "createdAt": 1000
            },
            {
                "id": "r1",
                "type": "follow-prompt",
                "priority": "normal",
                "payload": {"type": "inline-prompt", "content": "interrupted work"},
                "status": "running",
                "createdAt": 1000,
                "startedAt": 1500
            }
        ],
        "history": []
    });
    std::fs::write(
        dir.path().join("queue.json"),
        serde_json::to_string_pretty(&snapshot).expect("encode"),
    )
    .expect("seed snapshot");

    let queue = TaskQueueManager::new(TaskQueueConfig::default());
    let persistence =
        QueuePersistence::new(dir.path(), queue.clone(), QueuePersistenceConfig::default());
    persistence.restore();

    let queued = queue.get_queued();
    assert_eq!(queued.len(), 1);
    assert_ne!(queued[0].id, "q1");
    assert_eq!(queued[0].priority, TaskPriority::High);
    assert_eq!(queued[0].status, TaskStatus::Queued);
    assert_eq!(queued[0].created_at, 1000);

    let history = queue.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TaskStatus::Failed);
    assert!(history[0]
        .error
        .as_deref()
        .expect("error")
        .contains("Server restarted"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_debounce_coalesces_a_burst_into_one_write() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = TaskQueueManager::new(TaskQueueConfig::default());
    let persistence =
        QueuePersistence::new(dir.path(), queue.clone(), QueuePersistenceConfig::default());
    persistence.start();

    for ordinal in 0..10 {
        queue
            .enqueue(follow_prompt(&format!("task-{ordinal}"), TaskPriority::Normal))
            .expect("enqueue");
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    let path = dir.path().join("queue.json");
    assert!(path.exists());
    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
    assert_eq!(snapshot["pending"].as_array().expect("pending").len(), 10);
    assert!(!dir.path().join("queue.json.tmp").exists());

    let mtime_at_400 = std::fs::metadata(&path).expect("meta").modified().expect("mtime");
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mtime_at_800 = std::fs::metadata(&path).expect("meta").modified().expect("mtime");
    assert_eq!(mtime_at_400, mtime_at_800, "a quiet queue writes nothing");

    persistence.dispose();
}

#[tokio::test]
async fn scenario_corrupt_queue_file_restores_as_empty_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("queue.json"), "{ not valid json !!!").expect("corrupt");

    let queue = TaskQueueManager::new(TaskQueueConfig::default());
    let persistence =
        QueuePersistence::new(dir.path(), queue.clone(), QueuePersistenceConfig::default());
    persistence.restore();

    assert!(queue.get_queued().is_empty());
    assert!(queue.get_history().is_empty());
}

#[tokio::test]
async fn scenario_group_cancel_cascades_children_before_parent() {
    let registry = ProcessRegistry::new(ProcessRegistryConfig::default());
    let group = registry.register_group(
        "review everything",
        RegisterOptions {
            kind: "code-review-group".to_string(),
            ..RegisterOptions::default()
        },
    );
    let child_one = registry.register(
        "review file one",
        RegisterOptions {
            kind: "code-review".to_string(),
            parent_process_id: Some(group.clone()),
            ..RegisterOptions::default()
        },
    );
    let child_two = registry.register(
        "review file two",
        RegisterOptions {
            kind: "code-review".to_string(),
            parent_process_id: Some(group.clone()),
            ..RegisterOptions::default()
        },
    );

    let mut events = registry.subscribe();
    registry.cancel(&group);

    let mut updated = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ProcessEvent::Updated(record) = event {
            updated.push(record);
        }
    }
    let updated_ids: Vec<&str> = updated.iter().map(|record| record.id.as_str()).collect();
    assert_eq!(updated_ids, [child_one.as_str(), child_two.as_str(), group.as_str()]);

    for child_id in [&child_one, &child_two] {
        let child = registry.get(child_id).expect("child");
        assert_eq!(child.status, ProcessStatus::Cancelled);
        assert!(child
            .error
            .as_deref()
            .expect("error")
            .contains("parent cancelled"));
    }
    assert_eq!(
        registry.get(&group).expect("group").status,
        ProcessStatus::Cancelled
    );
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_sdk_outage_falls_back_to_cli_without_session_id() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let cli_script = dir.path().join("mock-cli.sh");
    std::fs::write(
        &cli_script,
        "#!/bin/sh\nprintf '{\"type\":\"result\",\"is_error\":false,\"result\":\"cli saved the day\"}'\n",
    )
    .expect("write script");
    let mut perms = std::fs::metadata(&cli_script)
        .expect("metadata")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&cli_script, perms).expect("chmod");

    let mut config = config_for(dir.path());
    config.backend.cli_executable = cli_script.display().to_string();
    let service = QueueService::new(config, Arc::new(UnavailableSdk)).expect("service");
    service.start();

    let id = service
        .queue()
        .enqueue(follow_prompt("rescue", TaskPriority::Normal))
        .expect("enqueue");
    wait_for(|| service.queue().get_history().len() == 1, "task finish").await;
    service.dispose();

    let task = service.queue().get_task(&id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);

    let process = service
        .registry()
        .get(&task.process_id.expect("process link"))
        .expect("process");
    assert_eq!(process.status, ProcessStatus::Completed);
    assert_eq!(process.result.as_deref(), Some("cli saved the day"));
    assert!(process.sdk_session_id.is_none(), "CLI runs never attach a session id");
    assert!(!service.registry().is_resumable(&process.id));
}
