//! Fire-and-forget outbound sync of registry mutations to a dashboard
//! server.
//!
//! Every public mutation method enqueues a request and returns
//! immediately; a single worker drains the bounded queue sequentially
//! with exponential back-off on failure. Sync errors never reach callers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relay_registry::ProcessRecord;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Configuration for the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncClientConfig {
    /// Dashboard base URL, e.g. `http://localhost:7433`.
    pub base_url: String,
    pub max_queue_size: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl SyncClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            max_queue_size: 500,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// One outbound mutation, kept until delivered or displaced.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    RegisterWorkspace { workspace: Value },
    CreateProcess { process: ProcessRecord },
    PatchProcess { process: ProcessRecord },
    DeleteProcess { process_id: String },
    CancelProcess { process_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    ConnectionChanged { connected: bool },
}

struct SyncInner {
    config: SyncClientConfig,
    http: reqwest::Client,
    queue: Mutex<VecDeque<SyncRequest>>,
    pending: Notify,
    connected: AtomicBool,
    disposed: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Non-blocking dashboard sync client.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<SyncInner>,
}

impl SyncClient {
    pub fn new(config: SyncClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SyncInner {
                config,
                http,
                queue: Mutex::new(VecDeque::new()),
                pending: Notify::new(),
                connected: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                events,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        lock_unpoisoned(&self.inner.queue).len()
    }

    pub fn register_workspace(&self, workspace: Value) {
        self.enqueue(SyncRequest::RegisterWorkspace { workspace });
    }

    pub fn create_process(&self, process: &ProcessRecord) {
        self.enqueue(SyncRequest::CreateProcess {
            process: process.clone(),
        });
    }

    pub fn patch_process(&self, process: &ProcessRecord) {
        self.enqueue(SyncRequest::PatchProcess {
            process: process.clone(),
        });
    }

    pub fn delete_process(&self, process_id: impl Into<String>) {
        self.enqueue(SyncRequest::DeleteProcess {
            process_id: process_id.into(),
        });
    }

    pub fn cancel_process(&self, process_id: impl Into<String>) {
        self.enqueue(SyncRequest::CancelProcess {
            process_id: process_id.into(),
        });
    }

    /// The one synchronous (awaited) call: probes the health endpoint and
    /// updates the connected flag.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/health", self.inner.config.base_url);
        let healthy = match self.inner.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                debug!("dashboard health probe failed: {error}");
                false
            }
        };
        set_connected(&self.inner, healthy);
        healthy
    }

    /// Starts the flush worker. Idempotent.
    pub fn start(&self) {
        let mut worker = lock_unpoisoned(&self.inner.worker);
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(async move {
            flush_loop(inner).await;
        }));
    }

    /// Drops the worker and every queued request without flushing.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        if let Some(worker) = lock_unpoisoned(&self.inner.worker).take() {
            worker.abort();
        }
        lock_unpoisoned(&self.inner.queue).clear();
    }

    fn enqueue(&self, request: SyncRequest) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = lock_unpoisoned(&self.inner.queue);
            let cap = self.inner.config.max_queue_size.max(1);
            while queue.len() >= cap {
                let dropped = queue.pop_front();
                if let Some(dropped) = dropped {
                    warn!("sync queue overflow, dropping oldest request: {dropped:?}");
                }
            }
            queue.push_back(request);
        }
        self.inner.pending.notify_one();
    }
}

async fn flush_loop(inner: Arc<SyncInner>) {
    let mut backoff = inner.config.initial_backoff;
    loop {
        if inner.disposed.load(Ordering::SeqCst) {
            break;
        }
        let next = lock_unpoisoned(&inner.queue).pop_front();
        let Some(request) = next else {
            inner.pending.notified().await;
            continue;
        };

        match send_request(&inner, &request).await {
            Ok(()) => {
                set_connected(&inner, true);
                backoff = inner.config.initial_backoff;
            }
            Err(error) => {
                debug!("dashboard sync failed, backing off: {error}");
                set_connected(&inner, false);
                {
                    // The failed request goes back to the head so ordering
                    // is preserved; overflow still favors newest items.
                    let mut queue = lock_unpoisoned(&inner.queue);
                    if queue.len() < inner.config.max_queue_size.max(1) {
                        queue.push_front(request);
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(inner.config.max_backoff);
            }
        }
    }
}

async fn send_request(inner: &Arc<SyncInner>, request: &SyncRequest) -> Result<(), String> {
    let base = inner.config.base_url.trim_end_matches('/');
    let builder = match request {
        SyncRequest::RegisterWorkspace { workspace } => inner
            .http
            .post(format!("{base}/api/workspaces"))
            .json(workspace),
        SyncRequest::CreateProcess { process } => inner
            .http
            .post(format!("{base}/api/processes"))
            .json(process),
        SyncRequest::PatchProcess { process } => inner
            .http
            .patch(format!("{base}/api/processes/{}", process.id))
            .json(process),
        SyncRequest::DeleteProcess { process_id } => inner
            .http
            .delete(format!("{base}/api/processes/{process_id}")),
        SyncRequest::CancelProcess { process_id } => inner
            .http
            .post(format!("{base}/api/processes/{process_id}/cancel")),
    };

    let response = builder.send().await.map_err(|error| error.to_string())?;
    if !response.status().is_success() {
        return Err(format!("dashboard returned status {}", response.status()));
    }
    Ok(())
}

fn set_connected(inner: &Arc<SyncInner>, connected: bool) {
    let previous = inner.connected.swap(connected, Ordering::SeqCst);
    if previous != connected {
        let _ = inner
            .events
            .send(SyncEvent::ConnectionChanged { connected });
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
