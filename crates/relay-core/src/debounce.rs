use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type PendingWrite = Box<dyn FnOnce() + Send>;

struct DebouncerInner {
    delay: Duration,
    generation: AtomicU64,
    pending: Mutex<Option<PendingWrite>>,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.inner.delay)
            .finish()
    }
}

/// Coalesces a burst of scheduled writes into a single execution of the
/// most recent closure once the configured quiet window elapses.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebouncerInner>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(DebouncerInner {
                delay,
                generation: AtomicU64::new(0),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Replaces any pending write with `write` and restarts the quiet
    /// window. Earlier scheduled closures for the same window are dropped.
    pub fn schedule<F>(&self, write: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = {
            let mut pending = lock_unpoisoned(&self.inner.pending);
            *pending = Some(Box::new(write));
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let inner = Arc::clone(&self.inner);
        spawn_background_future(async move {
            tokio::time::sleep(inner.delay).await;
            let write = {
                let mut pending = lock_unpoisoned(&inner.pending);
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                pending.take()
            };
            if let Some(write) = write {
                write();
            }
        });
    }

    /// Runs any pending write immediately, cancelling its timer.
    pub fn flush(&self) {
        let write = {
            let mut pending = lock_unpoisoned(&self.inner.pending);
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            pending.take()
        };
        if let Some(write) = write {
            write();
        }
    }

    /// True when a write is scheduled but has not run yet.
    pub fn has_pending(&self) -> bool {
        lock_unpoisoned(&self.inner.pending).is_some()
    }
}

/// Spawns `future` on the ambient tokio runtime, or on a throwaway
/// current-thread runtime when called outside one.
pub fn spawn_background_future<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
        return;
    }

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(future),
            Err(error) => tracing::warn!("debounce worker bootstrap failed: {error}"),
        }
    });
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
