//! Worker-facing operations: claim, heartbeat and report.
//!
//! Workers never write executions directly. Every call here is a
//! conditional update; a call that does not apply comes back as a
//! [`Rejection`] instead of an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::clock::after;
use crate::core::{AgentId, Clock, ExecutionId, ExecutionInstance, ExecutionStatus};
use crate::events::{Event, EventBus};
use crate::registry::UnitTypeRegistry;
use crate::results::ResultNotifier;
use crate::storage::{
    ExecutionCondition, ExecutionFilter, ExecutionPager, ExecutionUpdate, Storage, StorageError,
};

/// A worker's status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// PENDING for progress, or a terminal status.
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub intermediate_state: Option<Value>,
}

impl WorkerReport {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            intermediate_state: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_intermediate_state(mut self, state: Value) -> Self {
        self.intermediate_state = Some(state);
        self
    }
}

/// Why a worker call was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    /// The execution is not in a state that accepts the call.
    WrongState(ExecutionStatus),
    /// Another worker owns the execution.
    WrongWorker,
    /// Workers may only report PENDING, SUCCESS, FAILURE or ABORTED.
    InvalidStatus(ExecutionStatus),
    /// The execution kept changing while the report was merged. Safe to resend.
    Contended,
}

/// Result of a worker call.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome {
    /// The call applied; the execution as stored afterwards.
    Applied(ExecutionInstance),
    Rejected(Rejection),
}

impl GatewayOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, GatewayOutcome::Applied(_))
    }

    pub fn applied(self) -> Option<ExecutionInstance> {
        match self {
            GatewayOutcome::Applied(execution) => Some(execution),
            GatewayOutcome::Rejected(_) => None,
        }
    }
}

const REPORTABLE: [ExecutionStatus; 4] = [
    ExecutionStatus::Pending,
    ExecutionStatus::Success,
    ExecutionStatus::Failure,
    ExecutionStatus::Aborted,
];

/// Merge-and-write rounds before a report gives up on a busy row.
const REPORT_ATTEMPTS: usize = 5;

pub struct WorkerGateway {
    storage: Arc<dyn Storage>,
    registry: Arc<UnitTypeRegistry>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    notifier: Option<ResultNotifier>,
    page_size: usize,
}

impl WorkerGateway {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<UnitTypeRegistry>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            storage,
            registry,
            clock,
            events,
            notifier: None,
            page_size: 100,
        }
    }

    /// Send result callbacks on success.
    pub fn with_notifier(mut self, notifier: ResultNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Claim a SCHEDULED execution for `agent`. Counts one attempt.
    pub async fn claim(
        &self,
        id: &ExecutionId,
        agent: &AgentId,
    ) -> Result<GatewayOutcome, StorageError> {
        let now = self.clock.now();
        let update = ExecutionUpdate::new(now)
            .status(ExecutionStatus::Accepted)
            .worker(Some(agent.clone()))
            .increment_attempt()
            .heartbeat(now);
        let condition = ExecutionCondition::status(ExecutionStatus::Scheduled);

        if self.storage.update_execution(id, &update, &condition).await? == 0 {
            return self.rejection(id, None).await;
        }
        let execution = self.storage.get_execution(id).await?;
        info!(
            execution_id = %id,
            unit_id = %execution.unit_id,
            worker_id = %agent,
            attempt = execution.attempt_count,
            "execution claimed"
        );
        Ok(GatewayOutcome::Applied(execution))
    }

    /// Claim the first SCHEDULED execution nobody else wins.
    pub async fn claim_next(&self, agent: &AgentId) -> Result<Option<ExecutionInstance>, StorageError> {
        let mut pager = ExecutionPager::new(
            ExecutionFilter::with_statuses(&[ExecutionStatus::Scheduled]),
            self.page_size,
        );
        while let Some(page) = pager.next_page(self.storage.as_ref()).await? {
            for candidate in page {
                match self.claim(&candidate.id, agent).await? {
                    GatewayOutcome::Applied(execution) => return Ok(Some(execution)),
                    GatewayOutcome::Rejected(_) => {
                        debug!(execution_id = %candidate.id, "lost claim race, trying next");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Record that `agent` is still working on `id`.
    pub async fn heartbeat(
        &self,
        id: &ExecutionId,
        agent: &AgentId,
    ) -> Result<GatewayOutcome, StorageError> {
        let now = self.clock.now();
        let update = ExecutionUpdate::new(now).heartbeat(now);
        let condition = ExecutionCondition::status_in(&ExecutionStatus::CLAIMED)
            .and_worker(Some(agent.clone()));

        if self.storage.update_execution(id, &update, &condition).await? == 0 {
            return self.rejection(id, Some(agent)).await;
        }
        Ok(GatewayOutcome::Applied(self.storage.get_execution(id).await?))
    }

    /// Apply a worker report. Payloads are merged into what is stored.
    ///
    /// The write is guarded by the `updated_at` the merge was computed
    /// from. A report that overlaps another one re-reads and merges again,
    /// up to `REPORT_ATTEMPTS` times.
    pub async fn report(
        &self,
        id: &ExecutionId,
        agent: &AgentId,
        report: WorkerReport,
    ) -> Result<GatewayOutcome, StorageError> {
        if !REPORTABLE.contains(&report.status) {
            return Ok(GatewayOutcome::Rejected(Rejection::InvalidStatus(report.status)));
        }

        let mut written = None;
        for _ in 0..REPORT_ATTEMPTS {
            let current = match self.storage.get_execution(id).await {
                Ok(current) => current,
                Err(StorageError::NotFound(_)) => {
                    return Ok(GatewayOutcome::Rejected(Rejection::NotFound));
                }
                Err(e) => return Err(e),
            };
            if let Some(rejection) = Self::check_owner(&current, agent) {
                return Ok(GatewayOutcome::Rejected(rejection));
            }

            // Stored timestamps keep milliseconds; stay past the version read.
            let now = self
                .clock
                .now()
                .max(after(current.updated_at, chrono::Duration::milliseconds(1)));
            let update = Self::merged_update(&self.registry, &current, &report, now);
            let condition = ExecutionCondition::status_in(&ExecutionStatus::CLAIMED)
                .and_worker(Some(agent.clone()))
                .and_updated_at(current.updated_at);

            if self.storage.update_execution(id, &update, &condition).await? > 0 {
                written = Some(now);
                break;
            }
            debug!(execution_id = %id, worker_id = %agent, "report overlapped another write, merging again");
        }
        let Some(now) = written else {
            warn!(execution_id = %id, worker_id = %agent, "report kept losing to concurrent writes");
            return Ok(GatewayOutcome::Rejected(Rejection::Contended));
        };
        let execution = self.storage.get_execution(id).await?;

        if execution.status.is_terminal() {
            info!(
                execution_id = %id,
                unit_id = %execution.unit_id,
                status = %execution.status,
                attempt = execution.attempt_count,
                "execution finished"
            );
            self.events
                .emit(Event::ExecutionFinished {
                    execution_id: id.clone(),
                    unit_id: execution.unit_id.clone(),
                    status: execution.status,
                    timestamp: now,
                })
                .await;
        }
        if execution.status == ExecutionStatus::Success {
            self.spawn_callback(&execution);
        }
        Ok(GatewayOutcome::Applied(execution))
    }

    fn spawn_callback(&self, execution: &ExecutionInstance) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let storage = Arc::clone(&self.storage);
        let execution = execution.clone();
        tokio::spawn(async move {
            match storage.get_unit(&execution.unit_id).await {
                Ok(unit) => notifier.notify(&unit, &execution).await,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %execution.id,
                        unit_id = %execution.unit_id,
                        error = %e,
                        "cannot load unit for callback"
                    );
                }
            }
        });
    }

    fn merged_update(
        registry: &UnitTypeRegistry,
        current: &ExecutionInstance,
        report: &WorkerReport,
        now: DateTime<Utc>,
    ) -> ExecutionUpdate {
        let merger = registry.merger(&current.unit_type);
        let merge = |stored: Option<&Value>, incoming: Option<&Value>| {
            incoming.map(|incoming| merger.merge(stored, incoming))
        };
        let mut update = ExecutionUpdate::new(now).status(report.status).heartbeat(now);
        update.result = merge(current.result.as_ref(), report.result.as_ref());
        update.error = merge(current.error.as_ref(), report.error.as_ref());
        update.intermediate_state =
            merge(current.intermediate_state.as_ref(), report.intermediate_state.as_ref());
        update
    }

    fn check_owner(execution: &ExecutionInstance, agent: &AgentId) -> Option<Rejection> {
        if !execution.status.is_claimed() {
            Some(Rejection::WrongState(execution.status))
        } else if execution.worker_id.as_ref() != Some(agent) {
            Some(Rejection::WrongWorker)
        } else {
            None
        }
    }

    /// Explain why a conditional update did not apply. `owner` is the worker
    /// expected to hold the execution; claims pass `None`.
    async fn rejection(
        &self,
        id: &ExecutionId,
        owner: Option<&AgentId>,
    ) -> Result<GatewayOutcome, StorageError> {
        let rejection = match self.storage.get_execution(id).await {
            Ok(execution) => owner
                .and_then(|agent| Self::check_owner(&execution, agent))
                .unwrap_or(Rejection::WrongState(execution.status)),
            Err(StorageError::NotFound(_)) => Rejection::NotFound,
            Err(e) => return Err(e),
        };
        debug!(execution_id = %id, worker_id = ?owner, ?rejection, "worker call rejected");
        Ok(GatewayOutcome::Rejected(rejection))
    }
}
