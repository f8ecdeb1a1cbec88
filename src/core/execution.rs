//! Execution instances and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::iteration::Iteration;
use super::types::{
    AgentId, ExecutionId, IntegrationId, IterationId, RetryClassName, TenantId, UnitId, UnitType,
};
use super::unit::Priority;

/// Status of an execution instance.
///
/// ```text
/// UNASSIGNED -> SCHEDULED -> ACCEPTED -> PENDING -> SUCCESS | FAILURE | ABORTED
///                    ^           |          |
///                    +-----------+----------+   (retry reset)
/// SCHEDULED -> CANCELED                         (unit disabled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created but not yet placed in the queue.
    Unassigned,
    /// Queued, waiting for a worker to claim it.
    Scheduled,
    /// Claimed by a worker.
    Accepted,
    /// The worker reported progress.
    Pending,
    /// Finished successfully.
    Success,
    /// Finished with an error. May be retried.
    Failure,
    /// Aborted by the worker.
    Aborted,
    /// Canceled because the unit was disabled.
    Canceled,
}

impl ExecutionStatus {
    /// All statuses.
    pub const ALL: [ExecutionStatus; 8] = [
        ExecutionStatus::Unassigned,
        ExecutionStatus::Scheduled,
        ExecutionStatus::Accepted,
        ExecutionStatus::Pending,
        ExecutionStatus::Success,
        ExecutionStatus::Failure,
        ExecutionStatus::Aborted,
        ExecutionStatus::Canceled,
    ];

    /// Statuses counted as in flight by backpressure.
    pub const IN_FLIGHT: [ExecutionStatus; 3] = [
        ExecutionStatus::Scheduled,
        ExecutionStatus::Accepted,
        ExecutionStatus::Pending,
    ];

    /// Statuses in which a worker owns the execution.
    pub const CLAIMED: [ExecutionStatus; 2] = [ExecutionStatus::Accepted, ExecutionStatus::Pending];

    /// Statuses no sweep will touch again.
    pub const TERMINAL: [ExecutionStatus; 4] = [
        ExecutionStatus::Success,
        ExecutionStatus::Failure,
        ExecutionStatus::Aborted,
        ExecutionStatus::Canceled,
    ];

    /// Stable upper-case string form used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Unassigned => "UNASSIGNED",
            ExecutionStatus::Scheduled => "SCHEDULED",
            ExecutionStatus::Accepted => "ACCEPTED",
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failure => "FAILURE",
            ExecutionStatus::Aborted => "ABORTED",
            ExecutionStatus::Canceled => "CANCELED",
        }
    }

    /// Whether the status ends the main path.
    ///
    /// FAILURE counts as terminal here even though the retry engine may
    /// move it back to SCHEDULED.
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Whether the status counts towards backpressure.
    pub fn is_in_flight(self) -> bool {
        Self::IN_FLIGHT.contains(&self)
    }

    /// Whether a worker owns the execution.
    pub fn is_claimed(self) -> bool {
        Self::CLAIMED.contains(&self)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown execution status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for ExecutionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// One attempt-tracked run of a unit for a given iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInstance {
    pub id: ExecutionId,
    pub unit_id: UnitId,
    pub tenant_id: TenantId,
    pub integration_id: Option<IntegrationId>,
    pub unit_type: UnitType,
    pub status: ExecutionStatus,
    /// Worker that currently owns the execution.
    pub worker_id: Option<AgentId>,
    /// Number of claims so far. Never decreases.
    pub attempt_count: u32,
    /// Attempt ceiling resolved at creation.
    pub max_attempts: u32,
    /// Retry class resolved at creation.
    pub retry_class: RetryClassName,
    /// Constant retry wait overriding the class backoff, in seconds.
    pub retry_wait_secs: Option<i64>,
    /// Job timeout overriding the global one, in seconds.
    pub timeout_secs: Option<i64>,
    pub priority: Priority,
    /// Whether this is an incremental scan.
    pub partial: bool,
    pub iteration_id: IterationId,
    pub iteration_ts: DateTime<Utc>,
    /// Opaque result payload, merged across reports.
    pub result: Option<serde_json::Value>,
    /// Opaque error payload, merged across reports.
    pub error: Option<serde_json::Value>,
    /// Progress merged from non-terminal reports.
    pub intermediate_state: Option<serde_json::Value>,
    pub status_changed_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionInstance {
    /// Create an UNASSIGNED execution for `unit_id` in `iteration`.
    pub fn new(
        unit_id: impl Into<UnitId>,
        tenant_id: impl Into<TenantId>,
        unit_type: impl Into<UnitType>,
        iteration: &Iteration,
        partial: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            unit_id: unit_id.into(),
            tenant_id: tenant_id.into(),
            integration_id: None,
            unit_type: unit_type.into(),
            status: ExecutionStatus::Unassigned,
            worker_id: None,
            attempt_count: 0,
            max_attempts: super::retry::DEFAULT_MAX_ATTEMPTS,
            retry_class: RetryClassName::new(super::retry::DEFAULT_CLASS),
            retry_wait_secs: None,
            timeout_secs: None,
            priority: Priority::default(),
            partial,
            iteration_id: iteration.id.clone(),
            iteration_ts: iteration.ts,
            result: None,
            error: None,
            intermediate_state: None,
            status_changed_at: now,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to SCHEDULED, as the scheduling loop does before inserting.
    pub fn schedule(mut self, now: DateTime<Utc>) -> Self {
        self.status = ExecutionStatus::Scheduled;
        self.status_changed_at = now;
        self.updated_at = now;
        self
    }

    /// Set the status directly. Used by fixtures.
    pub fn with_status(mut self, status: ExecutionStatus, at: DateTime<Utc>) -> Self {
        self.status = status;
        self.status_changed_at = at;
        self.updated_at = at;
        self
    }

    /// Set the owning worker.
    pub fn with_worker(mut self, worker_id: impl Into<AgentId>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Set the attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempt_count = attempts;
        self
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the retry class.
    pub fn with_retry_class(mut self, class: impl Into<RetryClassName>) -> Self {
        self.retry_class = class.into();
        self
    }

    /// Set the result payload.
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Set the last heartbeat.
    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = Some(at);
        self
    }

    /// Iteration this execution belongs to.
    pub fn iteration(&self) -> Iteration {
        Iteration::new(self.iteration_id.clone(), self.iteration_ts)
    }

    /// Whether another attempt is allowed.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}
