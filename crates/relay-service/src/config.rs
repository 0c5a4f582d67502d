use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use relay_backend::{BackendInvokerConfig, BackendKind, CliConfig, SessionPoolConfig};
use relay_queue::{QueueExecutorConfig, QueuePersistenceConfig, TaskPriority, TaskQueueConfig};
use relay_registry::ProcessRegistryConfig;
use relay_sessions::ProcessMonitorConfig;
use relay_sync::SyncClientConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSection {
    /// When false, the executor is never started.
    pub enabled: bool,
    pub max_concurrency: usize,
    pub default_priority: TaskPriority,
    /// 0 means unbounded.
    pub max_queue_size: usize,
    pub keep_history: bool,
    pub max_history_size: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 1,
            default_priority: TaskPriority::Normal,
            max_queue_size: 0,
            keep_history: true,
            max_history_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistenceSection {
    pub debounce_ms: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistrySection {
    pub debounce_ms: u64,
    pub history_limit: usize,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SdkSection {
    pub max_sessions: usize,
    pub session_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub load_mcp_config: bool,
}

impl Default for SdkSection {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            session_timeout_ms: 600_000,
            request_timeout_ms: 600_000,
            load_mcp_config: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSection {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub clipboard_fallback: bool,
    pub cli_executable: String,
    pub sdk: SdkSection,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::Sdk,
            clipboard_fallback: false,
            cli_executable: "copilot".to_string(),
            sdk: SdkSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorSection {
    pub poll_interval_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSection {
    /// Dashboard base URL; sync is disabled when unset.
    pub url: Option<String>,
    pub max_queue_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: None,
            max_queue_size: 500,
        }
    }
}

/// Complete configuration surface, deserialized from TOML with per-key
/// defaults so partial files are fine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Directory owning `queue.json` and `process-registry.json`.
    pub data_dir: Option<PathBuf>,
    pub queue: QueueSection,
    pub persistence: PersistenceSection,
    pub registry: RegistrySection,
    pub backend: BackendSection,
    pub monitor: MonitorSection,
    pub server: ServerSection,
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse relay configuration")
    }

    /// Reads a config file; a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from(".relay"))
    }

    pub fn task_queue_config(&self) -> TaskQueueConfig {
        TaskQueueConfig {
            default_priority: self.queue.default_priority,
            max_queue_size: self.queue.max_queue_size,
            keep_history: self.queue.keep_history,
            max_history_size: self.queue.max_history_size,
        }
    }

    pub fn executor_config(&self) -> QueueExecutorConfig {
        QueueExecutorConfig {
            max_concurrency: self.queue.max_concurrency,
        }
    }

    pub fn persistence_config(&self) -> QueuePersistenceConfig {
        QueuePersistenceConfig {
            debounce: Duration::from_millis(self.persistence.debounce_ms),
        }
    }

    pub fn registry_config(&self) -> ProcessRegistryConfig {
        ProcessRegistryConfig {
            debounce: Duration::from_millis(self.registry.debounce_ms),
        }
    }

    pub fn invoker_config(&self) -> BackendInvokerConfig {
        BackendInvokerConfig {
            default_timeout_ms: self.backend.sdk.request_timeout_ms,
            pool: SessionPoolConfig {
                max_sessions: self.backend.sdk.max_sessions,
                idle_timeout: Duration::from_millis(self.backend.sdk.session_timeout_ms),
            },
        }
    }

    pub fn cli_config(&self) -> CliConfig {
        CliConfig {
            executable: self.backend.cli_executable.clone(),
            ..CliConfig::default()
        }
    }

    pub fn monitor_config(&self) -> ProcessMonitorConfig {
        ProcessMonitorConfig {
            poll_interval: Duration::from_millis(self.monitor.poll_interval_ms),
        }
    }

    pub fn sync_config(&self) -> Option<SyncClientConfig> {
        self.server.url.as_ref().map(|url| SyncClientConfig {
            max_queue_size: self.server.max_queue_size,
            ..SyncClientConfig::new(url.clone())
        })
    }
}
