//! Storage abstraction for units and execution instances.
//!
//! Every write that races with another replica goes through a conditional
//! update returning the number of affected rows. Zero means the condition
//! no longer held and the caller lost the race.
//!
//! Two backends are provided: [`InMemoryStorage`] for tests and development
//! and [`SqliteStorage`] behind the `sqlite` feature.

mod memory;
mod paging;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
pub use paging::{ExecutionPager, UnitPager};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::{
    AgentId, ExecutionId, ExecutionInstance, ExecutionStatus, IntegrationId, Iteration,
    IterationId, RetryClassName, SchedulableUnit, TenantId, UnitId, UnitType,
};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Offset paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// First page of `limit` rows.
    pub fn first(limit: usize) -> Self {
        Self::new(0, limit)
    }
}

/// Filter over units. Units are always returned in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    pub active: Option<bool>,
    pub tenant_id: Option<TenantId>,
    pub unit_types: Option<Vec<UnitType>>,
    /// Keyset cursor: only ids strictly greater.
    pub id_after: Option<UnitId>,
}

impl UnitFilter {
    /// Active units only.
    pub fn active() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    /// Whether `unit` passes the filter.
    pub fn matches(&self, unit: &SchedulableUnit) -> bool {
        self.active.is_none_or(|active| unit.active == active)
            && self.tenant_id.as_ref().is_none_or(|t| &unit.tenant_id == t)
            && self
                .unit_types
                .as_ref()
                .is_none_or(|types| types.contains(&unit.unit_type))
            && self.id_after.as_ref().is_none_or(|after| &unit.id > after)
    }
}

/// Patch applied to a unit.
#[derive(Debug, Clone)]
pub struct UnitUpdate {
    pub active: Option<bool>,
    pub last_iteration: Option<Iteration>,
    pub last_full_iteration_ts: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl UnitUpdate {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            active: None,
            last_iteration: None,
            last_full_iteration_ts: None,
            now,
        }
    }

    /// Advance the unit to `iteration`. Full iterations also move the full cadence.
    pub fn advance(now: DateTime<Utc>, iteration: Iteration, full: bool) -> Self {
        Self {
            last_full_iteration_ts: full.then_some(iteration.ts),
            last_iteration: Some(iteration),
            ..Self::new(now)
        }
    }

    pub fn set_active(now: DateTime<Utc>, active: bool) -> Self {
        Self {
            active: Some(active),
            ..Self::new(now)
        }
    }
}

/// Precondition of a unit update.
#[derive(Debug, Clone, Default)]
pub struct UnitCondition {
    /// Expected `last_iteration_ts`. `Some(None)` expects a unit that never ran.
    pub last_iteration_ts: Option<Option<DateTime<Utc>>>,
}

impl UnitCondition {
    pub fn last_iteration_ts(ts: Option<DateTime<Utc>>) -> Self {
        Self {
            last_iteration_ts: Some(ts),
        }
    }

    pub fn matches(&self, unit: &SchedulableUnit) -> bool {
        self.last_iteration_ts.is_none_or(|expected| {
            millis(unit.last_iteration_ts()) == millis(expected)
        })
    }
}

/// Sort order for execution listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionOrder {
    /// Ascending id, required for keyset paging.
    #[default]
    IdAsc,
    IterationAsc,
    IterationDesc,
}

/// Filter over executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub ids: Option<Vec<ExecutionId>>,
    pub unit_ids: Option<Vec<UnitId>>,
    pub statuses: Option<Vec<ExecutionStatus>>,
    pub tenant_id: Option<TenantId>,
    pub integration_id: Option<IntegrationId>,
    pub retry_classes: Option<Vec<RetryClassName>>,
    /// Only executions with `attempt_count < max_attempts`.
    pub below_max_attempts: bool,
    /// Only executions with `attempt_count >= max_attempts`.
    pub attempts_exhausted: bool,
    pub status_changed_before: Option<DateTime<Utc>>,
    /// Executions whose last heartbeat is older, or missing.
    pub heartbeat_before: Option<DateTime<Utc>>,
    pub partial: Option<bool>,
    pub iteration_id: Option<IterationId>,
    pub iteration_ts_at_or_after: Option<DateTime<Utc>>,
    pub iteration_ts_before: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Keyset cursor: only ids strictly greater.
    pub id_after: Option<ExecutionId>,
    pub order: ExecutionOrder,
}

impl ExecutionFilter {
    /// Executions in any of `statuses`.
    pub fn with_statuses(statuses: &[ExecutionStatus]) -> Self {
        Self {
            statuses: Some(statuses.to_vec()),
            ..Default::default()
        }
    }

    /// Restrict to one unit.
    pub fn for_unit(mut self, unit_id: &UnitId) -> Self {
        self.unit_ids = Some(vec![unit_id.clone()]);
        self
    }

    /// Whether `execution` passes the filter, ignoring order.
    pub fn matches(&self, execution: &ExecutionInstance) -> bool {
        let e = execution;
        self.ids.as_ref().is_none_or(|ids| ids.contains(&e.id))
            && self.unit_ids.as_ref().is_none_or(|ids| ids.contains(&e.unit_id))
            && self.statuses.as_ref().is_none_or(|s| s.contains(&e.status))
            && self.tenant_id.as_ref().is_none_or(|t| &e.tenant_id == t)
            && self
                .integration_id
                .as_ref()
                .is_none_or(|i| e.integration_id.as_ref() == Some(i))
            && self
                .retry_classes
                .as_ref()
                .is_none_or(|c| c.contains(&e.retry_class))
            && (!self.below_max_attempts || e.attempt_count < e.max_attempts)
            && (!self.attempts_exhausted || e.attempt_count >= e.max_attempts)
            && self
                .status_changed_before
                .is_none_or(|ts| e.status_changed_at < ts)
            && self
                .heartbeat_before
                .is_none_or(|ts| e.last_heartbeat.is_none_or(|hb| hb < ts))
            && self.partial.is_none_or(|p| e.partial == p)
            && self.iteration_id.as_ref().is_none_or(|i| &e.iteration_id == i)
            && self
                .iteration_ts_at_or_after
                .is_none_or(|ts| e.iteration_ts >= ts)
            && self.iteration_ts_before.is_none_or(|ts| e.iteration_ts < ts)
            && self.created_before.is_none_or(|ts| e.created_at < ts)
            && self.id_after.as_ref().is_none_or(|after| &e.id > after)
    }
}

/// Patch applied to an execution.
///
/// `status_changed_at` moves to `now` only when `status` differs from the
/// stored status. `updated_at` always moves.
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    /// `Some(None)` clears the worker.
    pub worker_id: Option<Option<AgentId>>,
    pub increment_attempt: bool,
    pub heartbeat: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub intermediate_state: Option<serde_json::Value>,
    pub now: DateTime<Utc>,
}

impl ExecutionUpdate {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            worker_id: None,
            increment_attempt: false,
            heartbeat: None,
            result: None,
            error: None,
            intermediate_state: None,
            now,
        }
    }

    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn worker(mut self, worker_id: Option<AgentId>) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn increment_attempt(mut self) -> Self {
        self.increment_attempt = true;
        self
    }

    pub fn heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.heartbeat = Some(at);
        self
    }

    /// Apply the patch to an in-memory row.
    pub fn apply(&self, execution: &mut ExecutionInstance) {
        if let Some(status) = self.status {
            if execution.status != status {
                execution.status_changed_at = self.now;
            }
            execution.status = status;
        }
        if let Some(worker_id) = &self.worker_id {
            execution.worker_id = worker_id.clone();
        }
        if self.increment_attempt {
            execution.attempt_count = execution.attempt_count.saturating_add(1);
        }
        if let Some(hb) = self.heartbeat {
            execution.last_heartbeat = Some(hb);
        }
        if let Some(result) = &self.result {
            execution.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            execution.error = Some(error.clone());
        }
        if let Some(state) = &self.intermediate_state {
            execution.intermediate_state = Some(state.clone());
        }
        execution.updated_at = self.now;
    }
}

/// Precondition of an execution update.
#[derive(Debug, Clone, Default)]
pub struct ExecutionCondition {
    pub status_in: Option<Vec<ExecutionStatus>>,
    /// Expected worker. `Some(None)` expects no worker.
    pub worker_id: Option<Option<AgentId>>,
    /// Expected `updated_at`, compared at millisecond precision.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExecutionCondition {
    pub fn status(status: ExecutionStatus) -> Self {
        Self::status_in(&[status])
    }

    pub fn status_in(statuses: &[ExecutionStatus]) -> Self {
        Self {
            status_in: Some(statuses.to_vec()),
            ..Default::default()
        }
    }

    pub fn and_worker(mut self, worker_id: Option<AgentId>) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Only apply if the row was not written since `updated_at` was read.
    pub fn and_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn matches(&self, execution: &ExecutionInstance) -> bool {
        self.status_in
            .as_ref()
            .is_none_or(|s| s.contains(&execution.status))
            && self
                .worker_id
                .as_ref()
                .is_none_or(|w| &execution.worker_id == w)
            && self
                .updated_at
                .is_none_or(|ts| millis(Some(ts)) == millis(Some(execution.updated_at)))
    }
}

/// Storage trait for persisting orchestrator state.
#[async_trait]
pub trait Storage: Send + Sync {
    // Unit operations

    /// Insert a new unit.
    async fn insert_unit(&self, unit: SchedulableUnit) -> Result<(), StorageError>;

    /// Get a unit by ID.
    async fn get_unit(&self, id: &UnitId) -> Result<SchedulableUnit, StorageError>;

    /// List units matching `filter` in ascending id order.
    async fn list_units(
        &self,
        filter: &UnitFilter,
        page: PageRequest,
    ) -> Result<Vec<SchedulableUnit>, StorageError>;

    /// Conditionally patch a unit. Returns the number of affected rows.
    async fn update_unit(
        &self,
        id: &UnitId,
        update: &UnitUpdate,
        condition: &UnitCondition,
    ) -> Result<u64, StorageError>;

    // Execution operations

    /// Insert a new execution.
    async fn insert_execution(&self, execution: ExecutionInstance) -> Result<(), StorageError>;

    /// Get an execution by ID.
    async fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInstance, StorageError>;

    /// List executions matching `filter`.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: PageRequest,
    ) -> Result<Vec<ExecutionInstance>, StorageError>;

    /// Count matching executions, stopping at `limit`.
    async fn count_executions(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> Result<usize, StorageError>;

    /// Conditionally patch an execution. Returns the number of affected rows.
    async fn update_execution(
        &self,
        id: &ExecutionId,
        update: &ExecutionUpdate,
        condition: &ExecutionCondition,
    ) -> Result<u64, StorageError>;

    /// Delete matching executions. Returns the number deleted.
    async fn delete_executions(&self, filter: &ExecutionFilter) -> Result<u64, StorageError>;

    /// Distinct iterations of a unit, newest first.
    async fn list_iterations(
        &self,
        unit_id: &UnitId,
        page: PageRequest,
    ) -> Result<Vec<Iteration>, StorageError>;
}

/// Millisecond precision used for every stored timestamp.
pub(crate) fn millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|ts| ts.timestamp_millis())
}
