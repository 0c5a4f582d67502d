use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use relay_backend::{BackendInvoker, CancelToken, InvokeOptions};
use relay_registry::{ProcessRegistry, RegisterOptions, SessionMetadata};

use crate::queue::TaskQueueManager;
use crate::task::{QueueEvent, QueueEventKind, Task};

/// Tuning for the executor driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueExecutorConfig {
    pub max_concurrency: usize,
}

impl Default for QueueExecutorConfig {
    fn default() -> Self {
        Self { max_concurrency: 1 }
    }
}

struct ExecutorInner {
    queue: TaskQueueManager,
    registry: ProcessRegistry,
    invoker: Arc<BackendInvoker>,
    base_options: InvokeOptions,
    max_concurrency: AtomicUsize,
    running: Mutex<HashMap<String, CancelToken>>,
    wake: Notify,
    shutdown: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Drives the queue under a concurrency cap.
///
/// A single driver loop starts tasks in queue order — so same-priority
/// tasks begin in enqueue order and `high` always beats `normal`/`low` —
/// and each execution task registers a process, invokes the backend, and
/// mirrors the outcome into both the queue and the registry. Running
/// tasks are never preempted; cancel requests trip the task's token.
#[derive(Clone)]
pub struct QueueExecutor {
    inner: Arc<ExecutorInner>,
}

impl QueueExecutor {
    pub fn new(
        queue: TaskQueueManager,
        registry: ProcessRegistry,
        invoker: Arc<BackendInvoker>,
        base_options: InvokeOptions,
        config: QueueExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                queue,
                registry,
                invoker,
                base_options,
                max_concurrency: AtomicUsize::new(config.max_concurrency.max(1)),
                running: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Starts the driver loop. Idempotent.
    pub fn start(&self) {
        let mut driver = lock_unpoisoned(&self.inner.driver);
        if driver.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *driver = Some(tokio::spawn(async move {
            drive(inner).await;
        }));
    }

    /// Stops launching new tasks; running invocations finish on their own.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        if let Some(driver) = lock_unpoisoned(&self.inner.driver).take() {
            driver.abort();
        }
    }

    /// Applies immediately, also while the executor is running.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.inner
            .max_concurrency
            .store(max_concurrency.max(1), Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        lock_unpoisoned(&self.inner.running).len()
    }
}

async fn drive(inner: Arc<ExecutorInner>) {
    let mut events = inner.queue.subscribe();
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        launch_ready(&inner);
        tokio::select! {
            _ = inner.wake.notified() => {}
            event = events.recv() => match event {
                Ok(event) => handle_event(&inner, event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }
}

fn launch_ready(inner: &Arc<ExecutorInner>) {
    loop {
        if inner.queue.is_paused() {
            break;
        }
        let cap = inner.max_concurrency.load(Ordering::SeqCst).max(1);
        if lock_unpoisoned(&inner.running).len() >= cap {
            break;
        }
        let Some(next) = inner.queue.peek_next() else {
            break;
        };
        let Some(task) = inner.queue.mark_started(&next.id) else {
            continue;
        };
        let cancel = CancelToken::new();
        lock_unpoisoned(&inner.running).insert(task.id.clone(), cancel.clone());
        debug!(task_id = task.id.as_str(), "queue task started");
        let exec_inner = Arc::clone(inner);
        tokio::spawn(async move {
            run_task(&exec_inner, &task, &cancel).await;
            lock_unpoisoned(&exec_inner.running).remove(&task.id);
            exec_inner.wake.notify_one();
        });
    }
}

fn handle_event(inner: &Arc<ExecutorInner>, event: QueueEvent) {
    if event.kind != QueueEventKind::CancelRequested {
        return;
    }
    let Some(task_id) = event.task_id else {
        return;
    };
    let token = lock_unpoisoned(&inner.running).get(&task_id).cloned();
    if let Some(token) = token {
        token.cancel();
    }
}

async fn run_task(inner: &Arc<ExecutorInner>, task: &Task, cancel: &CancelToken) {
    let prompt = match task.payload.resolve_prompt() {
        Ok(prompt) => prompt,
        Err(error) => {
            inner.queue.mark_failed(&task.id, error.to_string());
            return;
        }
    };

    let process_id = inner.registry.register(
        &prompt,
        RegisterOptions {
            kind: format!("queue-{}", task.kind),
            metadata: Some(json!({
                "taskId": task.id,
                "displayName": task.display_name,
                "skill": task.payload.skill(),
            })),
            backend: Some(inner.base_options.backend),
            working_directory: task.payload.working_directory().map(Path::to_path_buf),
            ..RegisterOptions::default()
        },
    );
    inner.queue.set_process_id(&task.id, process_id.clone());

    let mut options = inner.base_options.clone();
    if let Some(working_directory) = task.payload.working_directory() {
        options.working_directory = Some(working_directory.to_path_buf());
    }
    // Per-task config wins over the payload's model hint.
    if let Some(model) = task
        .config
        .model
        .clone()
        .or_else(|| task.payload.model().map(str::to_string))
    {
        options.model = Some(model);
    }
    if task.config.timeout_ms.is_some() {
        options.timeout_ms = task.config.timeout_ms;
    }
    options.feature_name = Some(format!("queue-{}", task.kind));

    let outcome = inner.invoker.invoke(&prompt, &options, cancel).await;
    if outcome.cancelled {
        inner.queue.mark_cancelled(&task.id);
        inner.registry.cancel(&process_id);
    } else if outcome.success {
        inner.registry.attach_session_metadata(
            &process_id,
            SessionMetadata {
                sdk_session_id: outcome.session_id.clone(),
                backend: outcome.backend_used,
                working_directory: options.working_directory.clone(),
            },
        );
        inner.queue.mark_completed(&task.id);
        inner.registry.complete(&process_id, outcome.response);
    } else {
        let error = outcome
            .error
            .unwrap_or_else(|| "backend invocation failed".to_string());
        inner.queue.mark_failed(&task.id, error.clone());
        inner.registry.fail(&process_id, error);
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{QueueExecutor, QueueExecutorConfig};
    use crate::queue::{TaskQueueConfig, TaskQueueManager};
    use crate::task::{TaskInput, TaskPayload, TaskPriority, TaskStatus};
    use relay_backend::{
        BackendError, BackendInvoker, BackendInvokerConfig, CliBackend, CliInvokeRequest,
        CliReply, ClipboardSink, InvokeOptions, SdkAvailability, SdkClient, SdkReply,
        SdkSendRequest, SdkSession,
    };
    use relay_registry::{ProcessRegistry, ProcessRegistryConfig, ProcessStatus};

    struct EchoSession {
        id: String,
        delay: Duration,
        order: Arc<Mutex<Vec<String>>>,
        active: Arc<AtomicUsize>,
        peak_active: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SdkSession for EchoSession {
        fn id(&self) -> &str {
            &self.id
        }

        async fn send(&self, request: SdkSendRequest) -> Result<SdkReply, BackendError> {
            self.order
                .lock()
                .expect("order lock")
                .push(request.prompt.clone());
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_active.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(SdkReply {
                response: format!("echo: {}", request.prompt),
                session_id: Some(self.id.clone()),
            })
        }

        async fn close(&self) {}
    }

    #[derive(Clone)]
    struct EchoSdk {
        delay: Duration,
        order: Arc<Mutex<Vec<String>>>,
        active: Arc<AtomicUsize>,
        peak_active: Arc<AtomicUsize>,
        opened: Arc<AtomicUsize>,
    }

    impl EchoSdk {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                order: Arc::new(Mutex::new(Vec::new())),
                active: Arc::new(AtomicUsize::new(0)),
                peak_active: Arc::new(AtomicUsize::new(0)),
                opened: Arc::new(AtomicUsize::new(0)),
            }
        }
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
            let ordinal = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoSession {
                id: format!("sess-{ordinal}"),
                delay: self.delay,
                order: Arc::clone(&self.order),
                active: Arc::clone(&self.active),
                peak_active: Arc::clone(&self.peak_active),
            }))
        }

        async fn abort(&self, _session_id: &str) {}
    }

    struct DownSdk;

    #[async_trait]
    impl SdkClient for DownSdk {
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

    struct ScriptedCli {
        reply: Result<String, String>,
    }

    #[async_trait]
    impl CliBackend for ScriptedCli {
        async fn invoke(
            &self,
            _request: CliInvokeRequest,
            _cancel: &relay_backend::CancelToken,
        ) -> Result<CliReply, BackendError> {
            self.reply
                .clone()
                .map(|response| CliReply { response })
                .map_err(BackendError::Invocation)
        }
    }

    struct NullClipboard;

    impl ClipboardSink for NullClipboard {
        fn copy(&self, _text: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn invoker_for(sdk: impl SdkClient + 'static, cli: impl CliBackend + 'static) -> Arc<BackendInvoker> {
        Arc::new(BackendInvoker::new(
            Arc::new(sdk),
            Arc::new(cli),
            Arc::new(NullClipboard),
            BackendInvokerConfig::default(),
        ))
    }

    fn harness(
        invoker: Arc<BackendInvoker>,
        max_concurrency: usize,
    ) -> (TaskQueueManager, ProcessRegistry, QueueExecutor) {
        let queue = TaskQueueManager::new(TaskQueueConfig::default());
        let registry = ProcessRegistry::new(ProcessRegistryConfig::default());
        let executor = QueueExecutor::new(
            queue.clone(),
            registry.clone(),
            invoker,
            InvokeOptions::default(),
            QueueExecutorConfig { max_concurrency },
        );
        (queue, registry, executor)
    }

    fn task_input(name: &str, priority: TaskPriority) -> TaskInput {
        TaskInput {
            kind: "follow-prompt".to_string(),
            priority: Some(priority),
            payload: TaskPayload::inline(name),
            display_name: Some(name.to_string()),
            ..TaskInput::default()
        }
    }

    async fn wait_for_history(queue: &TaskQueueManager, len: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if queue.get_history().len() >= len {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "queue did not reach {len} finished tasks"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn functional_tasks_start_in_priority_then_fifo_order() {
        let sdk = EchoSdk::new(Duration::from_millis(10));
        let order = Arc::clone(&sdk.order);
        let (queue, _registry, executor) = harness(invoker_for(sdk, ScriptedCli { reply: Ok("unused".to_string()) }), 1);

        queue.enqueue(task_input("t1-normal", TaskPriority::Normal)).expect("t1");
        queue.enqueue(task_input("t2-low", TaskPriority::Low)).expect("t2");
        queue.enqueue(task_input("t3-high", TaskPriority::High)).expect("t3");
        executor.start();

        wait_for_history(&queue, 3).await;
        executor.stop();

        assert_eq!(
            order.lock().expect("order").as_slice(),
            ["t3-high", "t1-normal", "t2-low"]
        );
        let history = queue.get_history();
        assert!(history
            .iter()
            .all(|task| task.status == TaskStatus::Completed));
        assert_eq!(history.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn functional_concurrency_cap_bounds_parallel_executions() {
        let sdk = EchoSdk::new(Duration::from_millis(100));
        let peak = Arc::clone(&sdk.peak_active);
        let (queue, _registry, executor) = harness(invoker_for(sdk, ScriptedCli { reply: Ok("unused".to_string()) }), 2);

        for ordinal in 0..4 {
            queue
                .enqueue(task_input(&format!("task-{ordinal}"), TaskPriority::Normal))
                .expect("enqueue");
        }
        executor.start();

        wait_for_history(&queue, 4).await;
        executor.stop();

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "cap must hold, saw {peak} concurrent sends");
        assert!(peak == 2, "two slots should actually be used");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn functional_executor_links_task_to_registry_process() {
        let sdk = EchoSdk::new(Duration::from_millis(5));
        let (queue, registry, executor) = harness(invoker_for(sdk, ScriptedCli { reply: Ok("unused".to_string()) }), 1);

        let id = queue
            .enqueue(task_input("link me", TaskPriority::Normal))
            .expect("enqueue");
        executor.start();
        wait_for_history(&queue, 1).await;
        executor.stop();

        let task = queue.get_task(&id).expect("task");
        assert_eq!(task.status, TaskStatus::Completed);
        let process_id = task.process_id.expect("process link");
        let process = registry.get(&process_id).expect("process");
        assert_eq!(process.kind, "queue-follow-prompt");
        assert_eq!(process.status, ProcessStatus::Completed);
        assert_eq!(process.result.as_deref(), Some("echo: link me"));
        assert!(process.sdk_session_id.is_some());
        assert!(registry.is_resumable(&process_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn functional_cancelling_running_task_cancels_task_and_process() {
        let sdk = EchoSdk::new(Duration::from_secs(30));
        let (queue, registry, executor) = harness(invoker_for(sdk, ScriptedCli { reply: Ok("unused".to_string()) }), 1);

        let id = queue
            .enqueue(task_input("slow work", TaskPriority::Normal))
            .expect("enqueue");
        executor.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.get_running().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "task never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(queue.cancel(&id));
        wait_for_history(&queue, 1).await;
        executor.stop();

        let task = queue.get_task(&id).expect("task");
        assert_eq!(task.status, TaskStatus::Cancelled);
        let process = registry
            .get(&task.process_id.expect("process link"))
            .expect("process");
        assert_eq!(process.status, ProcessStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn functional_backend_failure_marks_task_and_process_failed() {
        let (queue, registry, executor) = harness(
            invoker_for(DownSdk, ScriptedCli { reply: Err("cli exploded".to_string()) }),
            1,
        );

        let id = queue
            .enqueue(task_input("doomed", TaskPriority::Normal))
            .expect("enqueue");
        executor.start();
        wait_for_history(&queue, 1).await;
        executor.stop();

        let task = queue.get_task(&id).expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().expect("error").contains("cli exploded"));
        let process = registry
            .get(&task.process_id.expect("process link"))
            .expect("process");
        assert_eq!(process.status, ProcessStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn regression_unresolvable_prompt_file_fails_without_a_process() {
        let sdk = EchoSdk::new(Duration::from_millis(5));
        let (queue, registry, executor) = harness(invoker_for(sdk, ScriptedCli { reply: Ok("unused".to_string()) }), 1);

        let id = queue
            .enqueue(TaskInput {
                kind: "follow-prompt".to_string(),
                payload: TaskPayload::PromptFile {
                    prompt_file: "/nonexistent/prompt.md".into(),
                    working_directory: None,
                    skill: None,
                    model: None,
                    context: None,
                },
                ..TaskInput::default()
            })
            .expect("enqueue");
        executor.start();
        wait_for_history(&queue, 1).await;
        executor.stop();

        let task = queue.get_task(&id).expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.process_id.is_none());
        assert_eq!(registry.counts().total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn functional_pause_holds_queued_tasks_until_resume() {
        let sdk = EchoSdk::new(Duration::from_millis(5));
        let (queue, _registry, executor) = harness(invoker_for(sdk, ScriptedCli { reply: Ok("unused".to_string()) }), 1);

        queue.pause();
        queue
            .enqueue(task_input("held", TaskPriority::Normal))
            .expect("enqueue");
        executor.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.get_history().is_empty(), "paused queue must not run");
        assert_eq!(queue.stats().queued, 1);

        queue.resume();
        wait_for_history(&queue, 1).await;
        executor.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn functional_raising_concurrency_applies_while_running() {
        let sdk = EchoSdk::new(Duration::from_millis(150));
        let peak = Arc::clone(&sdk.peak_active);
        let (queue, _registry, executor) = harness(invoker_for(sdk, ScriptedCli { reply: Ok("unused".to_string()) }), 1);

        for ordinal in 0..3 {
            queue
                .enqueue(task_input(&format!("task-{ordinal}"), TaskPriority::Normal))
                .expect("enqueue");
        }
        executor.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        executor.set_max_concurrency(3);

        wait_for_history(&queue, 3).await;
        executor.stop();
        assert!(
            peak.load(Ordering::SeqCst) >= 2,
            "raised cap should allow parallel sends"
        );
    }
}
