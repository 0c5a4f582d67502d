use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use relay_core::{current_unix_timestamp_ms, spawn_background_future};

use crate::sdk::{SdkClient, SdkSession};
use crate::types::BackendError;

/// Configuration for the reusable-session pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPoolConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

struct IdleEntry {
    session: Arc<dyn SdkSession>,
    working_directory: Option<PathBuf>,
    last_used_unix_ms: u64,
    idle_epoch: u64,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleEntry>,
    total: usize,
    next_epoch: u64,
}

struct PoolInner {
    client: Arc<dyn SdkClient>,
    config: SessionPoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

/// A session checked out of the pool; hand it back with
/// [`SessionPool::checkin`] when the invocation finishes.
pub struct PooledSession {
    pub session: Arc<dyn SdkSession>,
    working_directory: Option<PathBuf>,
}

impl PooledSession {
    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }
}

/// Point-in-time pool occupancy, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
}

enum CheckoutAction {
    Reuse(Arc<dyn SdkSession>),
    Create,
    EvictAndCreate(Arc<dyn SdkSession>),
    Wait,
}

/// Bounded pool of reusable SDK sessions keyed by working directory.
///
/// `checkout` prefers an idle session for the requested directory, then a
/// fresh slot, then evicts the least-recently-used idle session of another
/// directory, and only waits when every session is checked out. Returned
/// sessions idle out after the configured timeout and are closed.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(client: Arc<dyn SdkClient>, config: SessionPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                client,
                config,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub async fn checkout(
        &self,
        working_directory: Option<&Path>,
    ) -> Result<PooledSession, BackendError> {
        let max_sessions = self.inner.config.max_sessions.max(1);
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let action = {
                let mut state = lock_unpoisoned(&self.inner.state);
                if let Some(position) = state
                    .idle
                    .iter()
                    .position(|entry| entry.working_directory.as_deref() == working_directory)
                {
                    let entry = state.idle.remove(position);
                    CheckoutAction::Reuse(entry.session)
                } else if state.total < max_sessions {
                    state.total += 1;
                    CheckoutAction::Create
                } else if let Some(position) = state
                    .idle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, entry)| entry.last_used_unix_ms)
                    .map(|(position, _)| position)
                {
                    let entry = state.idle.remove(position);
                    CheckoutAction::EvictAndCreate(entry.session)
                } else {
                    CheckoutAction::Wait
                }
            };

            match action {
                CheckoutAction::Reuse(session) => {
                    return Ok(PooledSession {
                        session,
                        working_directory: working_directory.map(Path::to_path_buf),
                    });
                }
                CheckoutAction::Create => {
                    return self.open_counted_session(working_directory).await;
                }
                CheckoutAction::EvictAndCreate(evicted) => {
                    evicted.close().await;
                    return self.open_counted_session(working_directory).await;
                }
                CheckoutAction::Wait => {
                    notified.await;
                }
            }
        }
    }

    /// Marks the session idle and arms its eviction timer.
    pub async fn checkin(&self, pooled: PooledSession) {
        let idle_timeout = self.inner.config.idle_timeout;
        let epoch = {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.next_epoch += 1;
            let epoch = state.next_epoch;
            state.idle.push(IdleEntry {
                session: Arc::clone(&pooled.session),
                working_directory: pooled.working_directory.clone(),
                last_used_unix_ms: current_unix_timestamp_ms(),
                idle_epoch: epoch,
            });
            epoch
        };
        self.inner.released.notify_waiters();

        let inner = Arc::clone(&self.inner);
        spawn_background_future(async move {
            tokio::time::sleep(idle_timeout).await;
            let expired = {
                let mut state = lock_unpoisoned(&inner.state);
                match state
                    .idle
                    .iter()
                    .position(|entry| entry.idle_epoch == epoch)
                {
                    Some(position) => {
                        let entry = state.idle.remove(position);
                        state.total = state.total.saturating_sub(1);
                        Some(entry.session)
                    }
                    None => None,
                }
            };
            if let Some(session) = expired {
                session.close().await;
                inner.released.notify_waiters();
            }
        });
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock_unpoisoned(&self.inner.state);
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
        }
    }

    /// Closes every idle session and forgets it. Checked-out sessions are
    /// closed by their idle timers once returned.
    pub async fn dispose(&self) {
        let drained = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        for entry in drained {
            entry.session.close().await;
        }
        self.inner.released.notify_waiters();
    }

    async fn open_counted_session(
        &self,
        working_directory: Option<&Path>,
    ) -> Result<PooledSession, BackendError> {
        match self.inner.client.open_session(working_directory).await {
            Ok(session) => Ok(PooledSession {
                session,
                working_directory: working_directory.map(Path::to_path_buf),
            }),
            Err(error) => {
                let mut state = lock_unpoisoned(&self.inner.state);
                state.total = state.total.saturating_sub(1);
                drop(state);
                self.inner.released.notify_waiters();
                Err(error)
            }
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
