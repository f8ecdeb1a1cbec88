//! Periodic sweeps and the scheduling loop.
//!
//! A [`Sweep`] is one pass of orchestration work. [`PeriodicTask`] runs a
//! sweep on a timer under the sweep's named lease. The scheduling loop
//! ([`SchedulingLoop`]) is the sweep that turns due units into executions.

mod backpressure;
mod engine;
mod handle;
mod periodic;
mod pool;
mod types;

pub use backpressure::BackpressureEvaluator;
pub use engine::{SchedulingConfig, SchedulingLoop};
pub use handle::SweepHandle;
pub use periodic::{PeriodicConfig, PeriodicTask};
pub use pool::{BatchOutcome, DispatchBatch, DispatchPool};
pub use types::{
    MonitorStats, RetryStats, SchedulerError, SchedulingStats, SweepReport, TaskState,
};

use async_trait::async_trait;

/// One pass of periodic orchestration work.
///
/// `run_once` never fails: per-row errors are logged and counted in the report.
#[async_trait]
pub trait Sweep: Send + Sync {
    /// Short name, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Lease the sweep runs under.
    fn lock_name(&self) -> &'static str;

    async fn run_once(&self) -> SweepReport;
}
