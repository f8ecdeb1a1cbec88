//! Wiring: builds every component from an [`OrchestratorConfig`] and runs
//! the three sweeps.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, LoopConfig, OrchestratorConfig, StorageConfig};
use crate::core::{Clock, SystemClock};
use crate::events::EventBus;
use crate::lock::{InMemoryLockService, LockService};
use crate::monitor::StuckMonitor;
use crate::registry::{AgentRegistry, UnitTypeRegistry};
use crate::results::{CallbackError, HttpCallback, ResultAggregator, ResultNotifier};
use crate::retry::RetryEngine;
use crate::scheduler::{PeriodicTask, SchedulingLoop, Sweep, SweepHandle, SweepReport};
use crate::storage::{InMemoryStorage, Storage, StorageError};
use crate::worker::WorkerGateway;

/// Errors while building the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("sqlite storage requested but the `sqlite` feature is disabled")]
    SqliteUnavailable,
}

/// The three periodic sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    Scheduling,
    Retry,
    Monitor,
}

impl SweepKind {
    pub const ALL: [SweepKind; 3] = [SweepKind::Scheduling, SweepKind::Retry, SweepKind::Monitor];
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SweepKind::Scheduling => "scheduling",
            SweepKind::Retry => "retry",
            SweepKind::Monitor => "monitor",
        })
    }
}

impl FromStr for SweepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SweepKind::ALL
            .into_iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown sweep '{}', expected scheduling, retry or monitor", s))
    }
}

/// Storage and lease backends.
pub struct Backends {
    pub storage: Arc<dyn Storage>,
    pub locks: Arc<dyn LockService>,
}

impl Backends {
    /// In-memory storage and leases.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            locks: Arc::new(InMemoryLockService::new(clock)),
        }
    }

    /// Open the backend named by `config`.
    pub async fn open(config: &StorageConfig, clock: Arc<dyn Clock>) -> Result<Self, RuntimeError> {
        match config {
            StorageConfig::Memory => Ok(Self::in_memory(clock)),
            #[cfg(feature = "sqlite")]
            StorageConfig::Sqlite { path } => {
                let sqlite =
                    Arc::new(crate::storage::SqliteStorage::new(path).await?.with_clock(clock));
                Ok(Self {
                    storage: sqlite.clone(),
                    locks: sqlite,
                })
            }
            #[cfg(not(feature = "sqlite"))]
            StorageConfig::Sqlite { .. } => Err(RuntimeError::SqliteUnavailable),
        }
    }
}

/// Every orchestration component, built once.
pub struct Runtime {
    config: OrchestratorConfig,
    locks: Arc<dyn LockService>,
    events: Arc<EventBus>,
    scheduling: Arc<SchedulingLoop>,
    retry: Arc<RetryEngine>,
    monitor: Arc<StuckMonitor>,
    gateway: Arc<WorkerGateway>,
    results: ResultAggregator,
}

impl Runtime {
    /// Validate `config`, open its storage and build the components.
    pub async fn from_config(
        config: OrchestratorConfig,
        agents: Arc<dyn AgentRegistry>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backends = Backends::open(&config.storage, Arc::clone(&clock)).await?;
        Self::with_backends(config, backends, agents, clock)
    }

    /// Build the components over existing backends.
    pub fn with_backends(
        config: OrchestratorConfig,
        backends: Backends,
        agents: Arc<dyn AgentRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RuntimeError> {
        let Backends { storage, locks } = backends;
        let registry: Arc<UnitTypeRegistry> = Arc::new(config.unit_type_registry());
        let events = Arc::new(EventBus::new());
        let results = ResultAggregator::new(Arc::clone(&storage)).with_page_size(config.page_size);

        let mut gateway = WorkerGateway::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            Arc::clone(&clock),
            Arc::clone(&events),
        )
        .with_page_size(config.page_size);
        if config.callback.enabled {
            let http = HttpCallback::new(Duration::from_secs(config.callback.timeout_secs))?;
            gateway = gateway.with_notifier(ResultNotifier::new(results.clone(), Arc::new(http)));
        }

        Ok(Self {
            scheduling: Arc::new(SchedulingLoop::new(
                Arc::clone(&storage),
                Arc::clone(&registry),
                Arc::clone(&clock),
                Arc::clone(&events),
                config.scheduling_config(),
            )),
            retry: Arc::new(RetryEngine::new(
                Arc::clone(&storage),
                Arc::clone(&registry),
                agents,
                Arc::clone(&clock),
                Arc::clone(&events),
                config.retry_config(),
            )),
            monitor: Arc::new(StuckMonitor::new(
                storage,
                clock,
                Arc::clone(&events),
                config.monitor_config(),
            )),
            gateway: Arc::new(gateway),
            results,
            events,
            locks,
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Bus every component emits on. Register handlers before `start`.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn gateway(&self) -> &Arc<WorkerGateway> {
        &self.gateway
    }

    pub fn results(&self) -> &ResultAggregator {
        &self.results
    }

    fn sweep(&self, kind: SweepKind) -> (Arc<dyn Sweep>, LoopConfig) {
        match kind {
            SweepKind::Scheduling => (self.scheduling.clone(), self.config.scheduling),
            SweepKind::Retry => (self.retry.clone(), self.config.retry),
            SweepKind::Monitor => (self.monitor.clone(), self.config.monitor),
        }
    }

    /// Periodic task for one sweep.
    pub fn task(&self, kind: SweepKind) -> PeriodicTask {
        let (sweep, timer) = self.sweep(kind);
        PeriodicTask::new(sweep, Arc::clone(&self.locks), self.config.periodic_config(timer))
    }

    /// Run one tick of `kind` under its lease, ignoring its timer.
    pub async fn run_once(&self, kind: SweepKind) -> Option<SweepReport> {
        self.task(kind).tick().await
    }

    /// Start every enabled sweep.
    pub fn start(&self) -> RuntimeHandle {
        let mut handle = RuntimeHandle::default();
        for kind in SweepKind::ALL {
            if let Some((sweep, task)) = self.task(kind).start() {
                handle.sweeps.push(sweep);
                handle.tasks.push(task);
            }
        }
        tracing::info!(
            instance_id = %self.config.instance_id,
            sweeps = handle.sweeps.len(),
            "runtime started"
        );
        handle
    }
}

/// Handles of the running sweeps.
#[derive(Default)]
pub struct RuntimeHandle {
    sweeps: Vec<SweepHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn sweeps(&self) -> &[SweepHandle] {
        &self.sweeps
    }

    pub fn sweep(&self, name: &str) -> Option<&SweepHandle> {
        self.sweeps.iter().find(|s| s.name() == name)
    }

    /// Stop every sweep, letting in-progress ticks finish.
    pub async fn shutdown(self) {
        for sweep in &self.sweeps {
            if let Err(e) = sweep.shutdown().await {
                tracing::warn!(sweep = sweep.name(), error = %e, "failed to stop sweep");
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sweep task ended abnormally");
            }
        }
        tracing::info!("runtime stopped");
    }
}
