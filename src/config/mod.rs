//! Orchestrator configuration.
//!
//! Loaded from YAML and overlaid with `CADENCE_*` environment variables.
//! Durations are signed seconds; zero or less disables the feature.

mod error;
mod yaml;

pub use error::ConfigError;
pub use yaml::YamlLoader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::core::clock::seconds;
use crate::core::{RetryPolicy, RetryPolicyTable};
use crate::monitor::MonitorConfig;
use crate::registry::UnitTypeRegistry;
use crate::retry::RetryConfig;
use crate::scheduler::{PeriodicConfig, SchedulingConfig};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CADENCE_";

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[default]
    Memory,
    /// SQLite storage.
    Sqlite {
        /// Path to the database file.
        path: PathBuf,
    },
}

/// Timer settings of one periodic sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Seconds between ticks. Zero or less disables the sweep.
    pub interval_secs: i64,
    /// Seconds to wait before the first tick.
    #[serde(default)]
    pub warmup_secs: i64,
}

impl LoopConfig {
    pub const fn new(interval_secs: i64, warmup_secs: i64) -> Self {
        Self {
            interval_secs,
            warmup_secs,
        }
    }
}

/// Opt-in limit on how long an execution may stay claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignedJobTimeout {
    pub enabled: bool,
    pub timeout_secs: i64,
}

impl Default for AssignedJobTimeout {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 24 * 3600,
        }
    }
}

/// Backpressure thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub default_threshold: usize,
    /// Threshold per unit type.
    pub per_type: HashMap<String, usize>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            default_threshold: 1,
            per_type: HashMap::new(),
        }
    }
}

/// Result callback settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 10,
        }
    }
}

/// Top-level configuration (cadence.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lock holder name of this replica.
    pub instance_id: String,
    pub storage: StorageConfig,
    pub lock_ttl_secs: i64,
    /// Rows per storage page in sweeps.
    pub page_size: usize,
    /// Concurrent execution creations in the scheduling loop.
    pub pool_size: usize,
    /// How long a scheduling tick waits for its dispatched creations.
    pub dispatch_timeout_secs: i64,
    pub scheduling: LoopConfig,
    pub retry: LoopConfig,
    pub monitor: LoopConfig,
    /// Default job timeout for claimed executions.
    pub job_timeout_secs: i64,
    pub assigned_job_timeout: AssignedJobTimeout,
    /// A claimed execution with no heartbeat for this long is orphaned.
    pub heartbeat_timeout_secs: i64,
    pub queued_stuck_threshold_secs: i64,
    /// Terminal executions older than this are deleted.
    pub retention_secs: i64,
    pub backpressure: BackpressureConfig,
    /// Retry classes. A class named `default` replaces the built-in default.
    pub retry_classes: Vec<RetryPolicy>,
    /// Unit type to retry class name.
    pub retry_bindings: HashMap<String, String>,
    pub callback: CallbackConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("cadence-{}", std::process::id()),
            storage: StorageConfig::default(),
            lock_ttl_secs: 60,
            page_size: 100,
            pool_size: 8,
            dispatch_timeout_secs: 60,
            scheduling: LoopConfig::new(30, 5),
            retry: LoopConfig::new(60, 10),
            monitor: LoopConfig::new(300, 15),
            job_timeout_secs: 3600,
            assigned_job_timeout: AssignedJobTimeout::default(),
            heartbeat_timeout_secs: 600,
            queued_stuck_threshold_secs: 3600,
            retention_secs: 0,
            backpressure: BackpressureConfig::default(),
            retry_classes: Vec::new(),
            retry_bindings: HashMap::new(),
            callback: CallbackConfig::default(),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Longest timer period or warmup, about thirty years.
const MAX_TIMER_SECS: u64 = 30 * 365 * 24 * 3600;

/// Positive seconds as a chrono duration, saturating.
pub(crate) fn secs(value: i64) -> Option<chrono::Duration> {
    (value > 0).then(|| seconds(value))
}

/// Positive seconds as a std duration, capped at [`MAX_TIMER_SECS`].
pub(crate) fn std_secs(value: i64) -> Option<std::time::Duration> {
    u64::try_from(value)
        .ok()
        .filter(|secs| *secs > 0)
        .map(|secs| std::time::Duration::from_secs(secs.min(MAX_TIMER_SECS)))
}

impl OrchestratorConfig {
    /// Overlay `CADENCE_*` variables from `vars`.
    ///
    /// Pass `std::env::vars()` in production. Variables without the prefix
    /// are ignored; unknown prefixed variables are logged and ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "INSTANCE_ID" => self.instance_id = value,
                "STORAGE" => {
                    self.storage = match value.trim() {
                        "memory" => StorageConfig::Memory,
                        "sqlite" => match &self.storage {
                            StorageConfig::Sqlite { path } => StorageConfig::Sqlite { path: path.clone() },
                            StorageConfig::Memory => StorageConfig::Sqlite {
                                path: PathBuf::from("cadence.db"),
                            },
                        },
                        _ => return Err(ConfigError::InvalidEnv { key, value }),
                    }
                }
                "SQLITE_PATH" => {
                    self.storage = StorageConfig::Sqlite {
                        path: PathBuf::from(value),
                    }
                }
                "LOCK_TTL_SECS" => self.lock_ttl_secs = parse(&key, &value)?,
                "PAGE_SIZE" => self.page_size = parse(&key, &value)?,
                "POOL_SIZE" => self.pool_size = parse(&key, &value)?,
                "DISPATCH_TIMEOUT_SECS" => self.dispatch_timeout_secs = parse(&key, &value)?,
                "SCHEDULING_INTERVAL_SECS" => self.scheduling.interval_secs = parse(&key, &value)?,
                "SCHEDULING_WARMUP_SECS" => self.scheduling.warmup_secs = parse(&key, &value)?,
                "RETRY_INTERVAL_SECS" => self.retry.interval_secs = parse(&key, &value)?,
                "RETRY_WARMUP_SECS" => self.retry.warmup_secs = parse(&key, &value)?,
                "MONITOR_INTERVAL_SECS" => self.monitor.interval_secs = parse(&key, &value)?,
                "MONITOR_WARMUP_SECS" => self.monitor.warmup_secs = parse(&key, &value)?,
                "JOB_TIMEOUT_SECS" => self.job_timeout_secs = parse(&key, &value)?,
                "ASSIGNED_JOB_TIMEOUT_ENABLED" => {
                    self.assigned_job_timeout.enabled = parse_bool(&key, &value)?
                }
                "ASSIGNED_JOB_TIMEOUT_SECS" => {
                    self.assigned_job_timeout.timeout_secs = parse(&key, &value)?
                }
                "HEARTBEAT_TIMEOUT_SECS" => self.heartbeat_timeout_secs = parse(&key, &value)?,
                "QUEUED_STUCK_THRESHOLD_SECS" => {
                    self.queued_stuck_threshold_secs = parse(&key, &value)?
                }
                "RETENTION_SECS" => self.retention_secs = parse(&key, &value)?,
                "DEFAULT_BACKPRESSURE_THRESHOLD" => {
                    self.backpressure.default_threshold = parse(&key, &value)?
                }
                "CALLBACK_ENABLED" => self.callback.enabled = parse_bool(&key, &value)?,
                "CALLBACK_TIMEOUT_SECS" => self.callback.timeout_secs = parse(&key, &value)?,
                _ => tracing::warn!(key = %key, "ignoring unknown configuration variable"),
            }
        }
        Ok(())
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("instance_id must not be empty".into()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::InvalidConfig("page_size must be positive".into()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidConfig("pool_size must be positive".into()));
        }
        if self.lock_ttl_secs <= 0 {
            return Err(ConfigError::InvalidConfig("lock_ttl_secs must be positive".into()));
        }
        for class in &self.retry_classes {
            if class.class.as_str().trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "retry class names must not be empty".into(),
                ));
            }
        }
        for (unit_type, class) in &self.retry_bindings {
            let known = class == crate::core::retry::DEFAULT_CLASS
                || self.retry_classes.iter().any(|c| c.class.as_str() == class);
            if !known {
                return Err(ConfigError::InvalidConfig(format!(
                    "unit type '{}' is bound to unknown retry class '{}'",
                    unit_type, class
                )));
            }
        }
        Ok(())
    }

    /// Retry classes and bindings as a lookup table.
    pub fn retry_table(&self) -> RetryPolicyTable {
        let table = self
            .retry_classes
            .iter()
            .cloned()
            .fold(RetryPolicyTable::default(), RetryPolicyTable::with_class);
        self.retry_bindings
            .iter()
            .fold(table, |table, (unit_type, class)| {
                table.bind(unit_type.as_str(), class.as_str())
            })
    }

    /// Unit-type policies from thresholds and retry classes.
    pub fn unit_type_registry(&self) -> UnitTypeRegistry {
        self.backpressure.per_type.iter().fold(
            UnitTypeRegistry::new(self.retry_table())
                .with_default_threshold(self.backpressure.default_threshold),
            |registry, (unit_type, threshold)| registry.with_threshold(unit_type.as_str(), *threshold),
        )
    }

    pub fn scheduling_config(&self) -> SchedulingConfig {
        SchedulingConfig {
            page_size: self.page_size,
            pool_size: self.pool_size,
            dispatch_timeout: std_secs(self.dispatch_timeout_secs),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            page_size: self.page_size,
            job_timeout: secs(self.job_timeout_secs),
            heartbeat_timeout: secs(self.heartbeat_timeout_secs),
            assigned_job_timeout: if self.assigned_job_timeout.enabled {
                secs(self.assigned_job_timeout.timeout_secs)
            } else {
                None
            },
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            page_size: self.page_size,
            queued_stuck_threshold: secs(self.queued_stuck_threshold_secs),
            retention: secs(self.retention_secs),
        }
    }

    /// Timer and lock settings for a sweep.
    pub fn periodic_config(&self, timer: LoopConfig) -> PeriodicConfig {
        PeriodicConfig {
            interval: std_secs(timer.interval_secs),
            warmup: std_secs(timer.warmup_secs).unwrap_or_default(),
            lock_ttl: secs(self.lock_ttl_secs).unwrap_or_else(|| seconds(60)),
            holder: self.instance_id.clone(),
        }
    }
}
