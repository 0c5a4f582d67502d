use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::info;

use relay_backend::{BackendInvoker, CliInvoker, InvokeOptions, SdkClient, SystemClipboard};
use relay_queue::{QueueExecutor, QueuePersistence, TaskQueueManager};
use relay_registry::{ProcessEvent, ProcessRegistry, RegistryStore};
use relay_sessions::{InteractiveSessionManager, ProcessMonitor, SystemTerminalLauncher};
use relay_sync::SyncClient;

use crate::config::RelayConfig;

/// Assembles the queue stack: manager, persistence, executor, registry,
/// and the optional dashboard sync client, all owned together so startup
/// and shutdown happen in one place.
pub struct QueueService {
    config: RelayConfig,
    queue: TaskQueueManager,
    registry: ProcessRegistry,
    executor: QueueExecutor,
    persistence: QueuePersistence,
    sync: Option<SyncClient>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl QueueService {
    /// Wires the components; the SDK backend is injected since it lives
    /// outside the core.
    pub fn new(config: RelayConfig, sdk: Arc<dyn SdkClient>) -> Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let queue = TaskQueueManager::new(config.task_queue_config());
        let registry = ProcessRegistry::with_store(
            RegistryStore::new(&data_dir, config.registry.history_limit),
            config.registry_config(),
        );
        let cli = CliInvoker::new(config.cli_config())?;
        let invoker = Arc::new(BackendInvoker::new(
            sdk,
            Arc::new(cli),
            Arc::new(SystemClipboard),
            config.invoker_config(),
        ));
        let base_options = InvokeOptions {
            backend: config.backend.kind,
            clipboard_fallback: config.backend.clipboard_fallback,
            // Parallel workloads reuse pooled sessions; a serial queue
            // sticks to ephemeral ones.
            use_pool: config.queue.max_concurrency > 1,
            ..InvokeOptions::default()
        };
        let executor = QueueExecutor::new(
            queue.clone(),
            registry.clone(),
            invoker,
            base_options,
            config.executor_config(),
        );
        let persistence = QueuePersistence::new(&data_dir, queue.clone(), config.persistence_config());
        let sync = config.sync_config().map(SyncClient::new);

        Ok(Self {
            config,
            queue,
            registry,
            executor,
            persistence,
            sync,
            forwarder: Mutex::new(None),
        })
    }

    /// Restores persisted state, starts persistence and sync, and — when
    /// the queue is enabled — the executor.
    pub fn start(&self) {
        self.registry.restore();
        self.persistence.restore();
        self.persistence.start();
        if let Some(sync) = &self.sync {
            sync.start();
            self.start_forwarder(sync.clone());
        }
        if self.config.queue.enabled {
            self.executor.start();
        } else {
            info!("queue executor disabled by configuration");
        }
    }

    /// Stops the executor, flushes persistence, and drops sync retries.
    pub fn dispose(&self) {
        self.executor.stop();
        if let Some(forwarder) = lock_unpoisoned(&self.forwarder).take() {
            forwarder.abort();
        }
        self.persistence.dispose();
        self.registry.dispose();
        if let Some(sync) = &self.sync {
            sync.dispose();
        }
    }

    pub fn queue(&self) -> &TaskQueueManager {
        &self.queue
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &QueueExecutor {
        &self.executor
    }

    pub fn persistence(&self) -> &QueuePersistence {
        &self.persistence
    }

    pub fn sync(&self) -> Option<&SyncClient> {
        self.sync.as_ref()
    }

    fn start_forwarder(&self, sync: SyncClient) {
        let mut events = self.registry.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProcessEvent::Added(record)) => sync.create_process(&record),
                    Ok(ProcessEvent::Updated(record)) => sync.patch_process(&record),
                    Ok(ProcessEvent::Removed(record)) => sync.delete_process(record.id),
                    Ok(ProcessEvent::Cleared) => {}
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *lock_unpoisoned(&self.forwarder) = Some(handle);
    }
}

/// Process-wide service instances, created at startup and disposed at
/// shutdown. Components never reach for these internally; they exist for
/// the outermost callers only.
#[derive(Clone)]
pub struct Services {
    pub monitor: ProcessMonitor,
    pub sessions: InteractiveSessionManager,
    pub queue: Arc<QueueService>,
}

impl Services {
    pub fn build(config: RelayConfig, sdk: Arc<dyn SdkClient>) -> Result<Self> {
        let monitor = ProcessMonitor::new(config.monitor_config());
        let sessions = InteractiveSessionManager::new(
            Arc::new(SystemTerminalLauncher),
            monitor.clone(),
        );
        let queue = Arc::new(QueueService::new(config, sdk)?);
        Ok(Self {
            monitor,
            sessions,
            queue,
        })
    }
}

static SERVICES: Mutex<Option<Services>> = Mutex::new(None);

pub fn init_services(services: Services) {
    *lock_unpoisoned(&SERVICES) = Some(services);
}

pub fn process_monitor() -> Option<ProcessMonitor> {
    lock_unpoisoned(&SERVICES)
        .as_ref()
        .map(|services| services.monitor.clone())
}

pub fn session_manager() -> Option<InteractiveSessionManager> {
    lock_unpoisoned(&SERVICES)
        .as_ref()
        .map(|services| services.sessions.clone())
}

pub fn queue_service() -> Option<Arc<QueueService>> {
    lock_unpoisoned(&SERVICES)
        .as_ref()
        .map(|services| Arc::clone(&services.queue))
}

/// Tears down the global instances. Test-only by convention.
pub fn reset_services_for_tests() {
    if let Some(services) = lock_unpoisoned(&SERVICES).take() {
        services.monitor.dispose();
        services.queue.dispose();
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
