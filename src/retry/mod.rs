//! Retry engine.
//!
//! Each tick makes two passes:
//!
//! 1. Failed executions whose retry wait has elapsed go back to SCHEDULED,
//!    one pass per retry class.
//! 2. Claimed executions past their job timeout are checked for an orphaned
//!    or stale worker. Those go back to SCHEDULED, or to a final FAILURE
//!    when they have no attempts left.
//!
//! Every transition is a conditional update on the status (and worker) that
//! was read. Zero affected rows means someone else moved the row first.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::clock::{age, seconds};
use crate::core::{Clock, ExecutionInstance, ExecutionStatus, RetryPolicy};
use crate::events::{Event, EventBus, RetryReason};
use crate::lock::names;
use crate::metrics;
use crate::registry::{AgentRegistry, UnitTypeRegistry};
use crate::scheduler::{RetryStats, Sweep, SweepReport};
use crate::storage::{
    ExecutionCondition, ExecutionFilter, ExecutionPager, ExecutionUpdate, Storage, StorageError,
};

const SWEEP: &str = "retry";

/// Settings of the retry engine.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub page_size: usize,
    /// Default job timeout of claimed executions. `None` disables the timeout pass
    /// for executions without their own timeout.
    pub job_timeout: Option<Duration>,
    /// Claimed executions without a heartbeat for this long count as orphaned.
    pub heartbeat_timeout: Option<Duration>,
    /// Opt-in limit on how long an execution may stay claimed.
    pub assigned_job_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            job_timeout: Some(Duration::hours(1)),
            heartbeat_timeout: Some(Duration::minutes(10)),
            assigned_job_timeout: None,
        }
    }
}

/// What the timeout pass decided for one claimed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Leave,
    Reset(RetryReason),
    Exhaust(RetryReason),
}

enum Applied {
    Done,
    LostRace,
}

/// Moves failed and abandoned executions back into the queue.
pub struct RetryEngine {
    storage: Arc<dyn Storage>,
    registry: Arc<UnitTypeRegistry>,
    agents: Arc<dyn AgentRegistry>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<UnitTypeRegistry>,
        agents: Arc<dyn AgentRegistry>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        config: RetryConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            agents,
            clock,
            events,
            config,
        }
    }

    /// Run both passes once.
    pub async fn tick(&self) -> RetryStats {
        let now = self.clock.now();
        let mut stats = RetryStats::default();

        for policy in self.registry.retry_table().policies() {
            self.retry_failed(policy, now, &mut stats).await;
        }
        self.reclaim_timed_out(now, &mut stats).await;

        if !stats.is_empty() {
            info!(
                retried = stats.retried,
                reset = stats.reset,
                failed = stats.failed,
                errors = stats.errors,
                "retry tick finished"
            );
        }
        stats
    }

    async fn retry_failed(&self, policy: &RetryPolicy, now: DateTime<Utc>, stats: &mut RetryStats) {
        let filter = ExecutionFilter {
            retry_classes: Some(vec![policy.class.clone()]),
            below_max_attempts: true,
            ..ExecutionFilter::with_statuses(&[ExecutionStatus::Failure])
        };
        let mut pager = ExecutionPager::new(filter, self.config.page_size);

        loop {
            let page = match pager.next_page(self.storage.as_ref()).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    self.row_error(stats, None, &e, "failed to list failed executions");
                    break;
                }
            };

            for execution in page {
                let wait = policy.wait(execution.attempt_count, execution.retry_wait_secs);
                if age(execution.status_changed_at, now) <= wait {
                    continue;
                }
                match self.reschedule(&execution, now).await {
                    Ok(Applied::Done) => {
                        stats.retried += 1;
                        self.record_retry(&execution, RetryReason::Failed, now).await;
                    }
                    Ok(Applied::LostRace) => {
                        stats.lost_races += 1;
                        debug!(execution_id = %execution.id, "failed execution changed concurrently");
                    }
                    Err(e) => self.row_error(stats, Some(&execution), &e, "failed to retry execution"),
                }
            }
        }
    }

    async fn reclaim_timed_out(&self, now: DateTime<Utc>, stats: &mut RetryStats) {
        let mut pager = ExecutionPager::new(
            ExecutionFilter::with_statuses(&ExecutionStatus::CLAIMED),
            self.config.page_size,
        );

        loop {
            let page = match pager.next_page(self.storage.as_ref()).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    self.row_error(stats, None, &e, "failed to list claimed executions");
                    break;
                }
            };

            for execution in page {
                let applied = match self.judge(&execution, now).await {
                    Verdict::Leave => continue,
                    Verdict::Reset(reason) => self
                        .reschedule(&execution, now)
                        .await
                        .map(|applied| (applied, Verdict::Reset(reason))),
                    Verdict::Exhaust(reason) => self
                        .exhaust(&execution, reason, now)
                        .await
                        .map(|applied| (applied, Verdict::Exhaust(reason))),
                };

                match applied {
                    Ok((Applied::Done, Verdict::Reset(reason))) => {
                        stats.reset += 1;
                        warn!(
                            execution_id = %execution.id,
                            unit_id = %execution.unit_id,
                            worker_id = ?execution.worker_id,
                            reason = %reason,
                            "reclaimed timed-out execution"
                        );
                        self.record_retry(&execution, reason, now).await;
                    }
                    Ok((Applied::Done, _)) => {
                        stats.failed += 1;
                        warn!(
                            execution_id = %execution.id,
                            unit_id = %execution.unit_id,
                            attempts = execution.attempt_count,
                            "timed-out execution has no attempts left"
                        );
                        metrics::record_timed_out(&execution);
                        self.events
                            .emit(Event::ExecutionExhausted {
                                execution_id: execution.id.clone(),
                                unit_id: execution.unit_id.clone(),
                                attempts: execution.attempt_count,
                                timestamp: now,
                            })
                            .await;
                    }
                    Ok((Applied::LostRace, _)) => {
                        stats.lost_races += 1;
                        debug!(execution_id = %execution.id, "claimed execution changed concurrently");
                    }
                    Err(e) => self.row_error(stats, Some(&execution), &e, "failed to reclaim execution"),
                }
            }
        }
    }

    /// Decide what to do with a claimed execution.
    async fn judge(&self, execution: &ExecutionInstance, now: DateTime<Utc>) -> Verdict {
        let timeout = execution
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(seconds)
            .or(self.config.job_timeout);
        let Some(timeout) = timeout else {
            return Verdict::Leave;
        };
        let claimed_for = age(execution.status_changed_at, now);
        if claimed_for <= timeout {
            return Verdict::Leave;
        }

        let reason = if self.is_orphaned(execution, now).await {
            RetryReason::Orphaned
        } else if self
            .config
            .assigned_job_timeout
            .is_some_and(|limit| claimed_for > limit)
        {
            RetryReason::Stale
        } else {
            return Verdict::Leave;
        };

        if execution.has_attempts_left() {
            Verdict::Reset(reason)
        } else {
            Verdict::Exhaust(reason)
        }
    }

    async fn is_orphaned(&self, execution: &ExecutionInstance, now: DateTime<Utc>) -> bool {
        let Some(worker) = &execution.worker_id else {
            return true;
        };
        if !self.agents.is_agent_live(worker).await {
            return true;
        }
        let last_sign_of_life = execution
            .last_heartbeat
            .map_or(execution.status_changed_at, |hb| hb.max(execution.status_changed_at));
        self.config
            .heartbeat_timeout
            .is_some_and(|limit| age(last_sign_of_life, now) > limit)
    }

    /// Back to SCHEDULED with the worker cleared. The attempt count is left
    /// alone; the next claim increments it.
    async fn reschedule(
        &self,
        execution: &ExecutionInstance,
        now: DateTime<Utc>,
    ) -> Result<Applied, StorageError> {
        let update = ExecutionUpdate::new(now)
            .status(ExecutionStatus::Scheduled)
            .worker(None);
        let condition = ExecutionCondition::status(execution.status)
            .and_worker(execution.worker_id.clone());
        self.apply(execution, &update, &condition).await
    }

    async fn exhaust(
        &self,
        execution: &ExecutionInstance,
        reason: RetryReason,
        now: DateTime<Utc>,
    ) -> Result<Applied, StorageError> {
        let mut update = ExecutionUpdate::new(now).status(ExecutionStatus::Failure);
        update.error = Some(json!({
            "reason": reason.to_string(),
            "message": "job timed out with no attempts left",
            "attempts": execution.attempt_count,
        }));
        let condition = ExecutionCondition::status_in(&ExecutionStatus::CLAIMED)
            .and_worker(execution.worker_id.clone());
        self.apply(execution, &update, &condition).await
    }

    async fn apply(
        &self,
        execution: &ExecutionInstance,
        update: &ExecutionUpdate,
        condition: &ExecutionCondition,
    ) -> Result<Applied, StorageError> {
        let affected = self
            .storage
            .update_execution(&execution.id, update, condition)
            .await?;
        Ok(if affected == 0 {
            Applied::LostRace
        } else {
            Applied::Done
        })
    }

    async fn record_retry(&self, execution: &ExecutionInstance, reason: RetryReason, now: DateTime<Utc>) {
        metrics::record_retried(execution, &reason.to_string());
        self.events
            .emit(Event::ExecutionRetried {
                execution_id: execution.id.clone(),
                unit_id: execution.unit_id.clone(),
                attempt: execution.attempt_count,
                reason,
                timestamp: now,
            })
            .await;
    }

    fn row_error(
        &self,
        stats: &mut RetryStats,
        execution: Option<&ExecutionInstance>,
        error: &StorageError,
        message: &'static str,
    ) {
        stats.errors += 1;
        metrics::record_sweep_failure(SWEEP);
        match execution {
            Some(e) => warn!(execution_id = %e.id, error = %error, "{}", message),
            None => warn!(error = %error, "{}", message),
        }
    }
}

#[async_trait]
impl Sweep for RetryEngine {
    fn name(&self) -> &'static str {
        SWEEP
    }

    fn lock_name(&self) -> &'static str {
        names::RETRY
    }

    async fn run_once(&self) -> SweepReport {
        SweepReport::Retry(self.tick().await)
    }
}
