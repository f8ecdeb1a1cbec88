//! cadence - orchestration core for recurring, tenant-scoped ingestion units.
//!
//! A [`SchedulableUnit`](core::SchedulableUnit) describes recurring work. The
//! [`SchedulingLoop`](scheduler::SchedulingLoop) turns due units into
//! [`ExecutionInstance`](core::ExecutionInstance)s, workers claim and report
//! them through the [`WorkerGateway`](worker::WorkerGateway), and the
//! [`RetryEngine`](retry::RetryEngine) and [`StuckMonitor`](monitor::StuckMonitor)
//! recover from failures and lost workers. [`Runtime`](runtime::Runtime)
//! wires everything from an [`OrchestratorConfig`](config::OrchestratorConfig).

pub mod config;
pub mod core;
pub mod events;
pub mod lock;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod results;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod testing;
pub mod worker;

pub use config::{ConfigError, OrchestratorConfig, YamlLoader};
pub use core::{
    AgentId, Clock, ExecutionId, ExecutionInstance, ExecutionStatus, Iteration, IterationId,
    RetryPolicy, SchedulableUnit, SystemClock, TenantId, UnitId, UnitType,
};
pub use events::{Event, EventBus, EventHandler};
pub use registry::{AgentRegistry, AssumeLive, StaticAgentRegistry, UnitTypeRegistry};
pub use runtime::{Runtime, RuntimeError, RuntimeHandle, SweepKind};
pub use storage::{InMemoryStorage, Storage, StorageError};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use worker::{GatewayOutcome, WorkerGateway, WorkerReport};
