//! Sweep type definitions.
//!
//! Error types, state, commands and per-tick reports of the periodic sweeps.

use thiserror::Error;
use tokio::sync::oneshot;

/// Errors talking to a running sweep.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Task is stopped.
    Stopped,
    /// Task is running.
    Running,
    /// Task is paused: ticks are skipped, `run_now` still works.
    Paused,
}

/// Commands that can be sent to a periodic task.
pub(crate) enum TaskCommand {
    /// Run one tick right away.
    RunNow {
        response: oneshot::Sender<Option<SweepReport>>,
    },
    /// Pause the task.
    Pause { response: oneshot::Sender<()> },
    /// Resume the task.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the task.
    Shutdown { response: oneshot::Sender<()> },
}

/// Counters of one scheduling tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulingStats {
    pub scanned: usize,
    pub schedulable: usize,
    pub backpressured: usize,
    pub dispatched: usize,
    /// Executions actually created.
    pub created: usize,
    pub lost_races: usize,
    pub failed: usize,
    /// Creations still running when the dispatch timeout hit.
    pub detached: usize,
}

/// Counters of one retry tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Failed executions moved back to SCHEDULED.
    pub retried: usize,
    /// Orphaned or stale executions moved back to SCHEDULED.
    pub reset: usize,
    /// Timed-out executions failed for good.
    pub failed: usize,
    pub lost_races: usize,
    pub errors: usize,
}

impl RetryStats {
    pub fn is_empty(&self) -> bool {
        self.retried == 0 && self.reset == 0 && self.failed == 0 && self.errors == 0
    }
}

/// Counters of one monitor tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub scanned: usize,
    pub stuck: usize,
    pub canceled: usize,
    /// Claimed executions of disabled units.
    pub flagged: usize,
    /// Executions whose unit does not exist.
    pub inconsistent: usize,
    pub deleted: u64,
    pub lost_races: usize,
    pub errors: usize,
}

/// Outcome of one sweep tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReport {
    Scheduling(SchedulingStats),
    Retry(RetryStats),
    Monitor(MonitorStats),
}
