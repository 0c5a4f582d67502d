use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Result of probing one pid. `exists` lets callers tell "never existed"
/// apart from "exists but we cannot signal it".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidProbe {
    pub running: bool,
    pub exists: bool,
    pub error: Option<String>,
}

impl PidProbe {
    fn gone() -> Self {
        Self {
            running: false,
            exists: false,
            error: None,
        }
    }
}

/// Probes whether a process is alive. PID 0 and negative PIDs are never
/// considered running.
pub fn probe_pid(pid: i64) -> PidProbe {
    if pid <= 0 {
        return PidProbe::gone();
    }
    probe_pid_impl(pid)
}

/// POSIX probe: a no-op signal. ESRCH means the process is gone; EPERM
/// means it exists but belongs to someone else, which still counts as
/// running.
#[cfg(unix)]
fn probe_pid_impl(pid: i64) -> PidProbe {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return PidProbe {
            running: true,
            exists: true,
            error: None,
        };
    }
    let errno = std::io::Error::last_os_error();
    match errno.raw_os_error() {
        Some(libc::ESRCH) => PidProbe::gone(),
        Some(libc::EPERM) => PidProbe {
            running: true,
            exists: true,
            error: None,
        },
        _ => PidProbe {
            running: false,
            exists: false,
            error: Some(errno.to_string()),
        },
    }
}

/// Windows probe: open a query-rights handle and check the exit code.
#[cfg(windows)]
fn probe_pid_impl(pid: i64) -> PidProbe {
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    if pid > u32::MAX as i64 {
        return PidProbe::gone();
    }
    unsafe {
        match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid as u32) {
            Ok(handle) => {
                let mut exit_code = 0u32;
                let queried = GetExitCodeProcess(handle, &mut exit_code).is_ok();
                let _ = CloseHandle(handle);
                PidProbe {
                    running: queried && exit_code == STILL_ACTIVE.0 as u32,
                    exists: true,
                    error: None,
                }
            }
            Err(error) => PidProbe {
                running: false,
                exists: false,
                error: Some(error.to_string()),
            },
        }
    }
}

/// Tuning for the shared poll timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMonitorConfig {
    pub poll_interval: Duration,
}

impl Default for ProcessMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

type TerminationCallback = Box<dyn FnOnce() + Send>;

struct Watch {
    pid: i64,
    callback: Option<TerminationCallback>,
}

struct MonitorInner {
    config: ProcessMonitorConfig,
    watches: Mutex<HashMap<String, Watch>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Detects OS-level process termination by polling registered pids on a
/// single shared timer. Each watch fires its callback exactly once and is
/// then removed; a pid that never existed is treated as terminated on the
/// first tick.
#[derive(Clone)]
pub struct ProcessMonitor {
    inner: Arc<MonitorInner>,
}

impl ProcessMonitor {
    pub fn new(config: ProcessMonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                watches: Mutex::new(HashMap::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Registers a watch; `on_terminated` runs once when the pid is gone.
    pub fn start_monitoring<F>(&self, key: impl Into<String>, pid: i64, on_terminated: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut watches = lock_unpoisoned(&self.inner.watches);
            watches.insert(
                key.into(),
                Watch {
                    pid,
                    callback: Some(Box::new(on_terminated)),
                },
            );
        }
        self.ensure_timer();
    }

    /// Removes a watch without firing its callback. Unknown keys are fine.
    pub fn stop_monitoring(&self, key: &str) {
        lock_unpoisoned(&self.inner.watches).remove(key);
    }

    pub fn watch_count(&self) -> usize {
        lock_unpoisoned(&self.inner.watches).len()
    }

    /// Cancels the timer and drops all watches without firing callbacks.
    pub fn dispose(&self) {
        if let Some(timer) = lock_unpoisoned(&self.inner.timer).take() {
            timer.abort();
        }
        lock_unpoisoned(&self.inner.watches).clear();
    }

    fn ensure_timer(&self) {
        let mut timer = lock_unpoisoned(&self.inner.timer);
        if timer.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(inner.config.poll_interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                poll_watches(&inner);
            }
        }));
    }
}

fn poll_watches(inner: &Arc<MonitorInner>) {
    let snapshot: Vec<(String, i64)> = {
        let watches = lock_unpoisoned(&inner.watches);
        watches
            .iter()
            .map(|(key, watch)| (key.clone(), watch.pid))
            .collect()
    };

    for (key, pid) in snapshot {
        if probe_pid(pid).running {
            continue;
        }
        let callback = {
            let mut watches = lock_unpoisoned(&inner.watches);
            watches
                .remove(&key)
                .and_then(|mut watch| watch.callback.take())
        };
        if let Some(callback) = callback {
            debug!(key = key.as_str(), pid, "watched process terminated");
            callback();
        }
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{probe_pid, ProcessMonitor, ProcessMonitorConfig};

    fn fast_monitor() -> ProcessMonitor {
        ProcessMonitor::new(ProcessMonitorConfig {
            poll_interval: Duration::from_millis(20),
        })
    }

    #[test]
    fn unit_zero_and_negative_pids_are_never_running() {
        for pid in [0, -1, -4096] {
            let probe = probe_pid(pid);
            assert!(!probe.running);
            assert!(!probe.exists);
        }
    }

    #[cfg(unix)]
    #[test]
    fn unit_own_pid_probes_as_running() {
        let probe = probe_pid(std::process::id() as i64);
        assert!(probe.running);
        assert!(probe.exists);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn functional_termination_callback_fires_exactly_once() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("0.1")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("child pid") as i64;

        let monitor = fast_monitor();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback_fired = Arc::clone(&fired);
        monitor.start_monitoring("watch-1", pid, move || {
            callback_fired.fetch_add(1, Ordering::SeqCst);
        });

        let _ = child.wait().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.watch_count(), 0, "fired watches are removed");
        monitor.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn functional_nonexistent_pid_terminates_on_first_tick() {
        let monitor = fast_monitor();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback_fired = Arc::clone(&fired);
        // Negative pids never exist, so the first poll reports termination.
        monitor.start_monitoring("watch-ghost", -7, move || {
            callback_fired.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        monitor.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unit_stop_monitoring_suppresses_the_callback() {
        let monitor = fast_monitor();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback_fired = Arc::clone(&fired);
        monitor.start_monitoring("watch-stopped", -7, move || {
            callback_fired.fetch_add(1, Ordering::SeqCst);
        });
        monitor.stop_monitoring("watch-stopped");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        monitor.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn regression_dispose_drops_watches_without_firing() {
        let monitor = ProcessMonitor::new(ProcessMonitorConfig {
            poll_interval: Duration::from_millis(500),
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let callback_fired = Arc::clone(&fired);
        monitor.start_monitoring("watch-disposed", -7, move || {
            callback_fired.fetch_add(1, Ordering::SeqCst);
        });
        monitor.dispose();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.watch_count(), 0);
    }
}
