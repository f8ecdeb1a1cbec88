//! Stuck and orphan monitor.
//!
//! Flags executions sitting in the queue too long, cancels queued work of
//! disabled units and enforces retention on terminal executions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::core::clock::before;
use crate::core::{Clock, ExecutionInstance, ExecutionStatus, SchedulableUnit, UnitId};
use crate::events::{Event, EventBus};
use crate::lock::names;
use crate::metrics;
use crate::scheduler::{MonitorStats, Sweep, SweepReport};
use crate::storage::{
    ExecutionCondition, ExecutionFilter, ExecutionOrder, ExecutionPager, ExecutionUpdate,
    PageRequest, Storage, StorageError, UnitFilter, UnitPager,
};

const SWEEP: &str = "monitor";

/// Settings of the monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub page_size: usize,
    /// SCHEDULED executions older than this are flagged. `None` disables the pass.
    pub queued_stuck_threshold: Option<Duration>,
    /// Terminal executions older than this are deleted. `None` keeps them forever.
    pub retention: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            queued_stuck_threshold: Some(Duration::hours(1)),
            retention: None,
        }
    }
}

/// Unit lookups cached for one tick.
enum CachedUnit {
    Found(SchedulableUnit),
    Missing,
}

pub struct StuckMonitor {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    config: MonitorConfig,
}

impl StuckMonitor {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            events,
            config,
        }
    }

    pub async fn tick(&self) -> MonitorStats {
        let now = self.clock.now();
        let mut stats = MonitorStats::default();

        if let Some(cutoff) = self.config.queued_stuck_threshold.and_then(|t| before(now, t)) {
            self.flag_queue_stuck(cutoff, now, &mut stats).await;
        }
        self.sweep_disabled_units(now, &mut stats).await;
        if let Some(cutoff) = self.config.retention.and_then(|r| before(now, r)) {
            self.enforce_retention(cutoff, &mut stats).await;
        }

        metrics::set_scanned(SWEEP, stats.scanned);
        if stats.stuck + stats.canceled + stats.flagged + stats.inconsistent + stats.errors > 0
            || stats.deleted > 0
        {
            info!(
                scanned = stats.scanned,
                stuck = stats.stuck,
                canceled = stats.canceled,
                flagged = stats.flagged,
                inconsistent = stats.inconsistent,
                deleted = stats.deleted,
                errors = stats.errors,
                "monitor tick finished"
            );
        }
        stats
    }

    async fn flag_queue_stuck(&self, before: DateTime<Utc>, now: DateTime<Utc>, stats: &mut MonitorStats) {
        let filter = ExecutionFilter {
            status_changed_before: Some(before),
            ..ExecutionFilter::with_statuses(&[ExecutionStatus::Scheduled])
        };
        let mut pager = ExecutionPager::new(filter, self.config.page_size);

        loop {
            let page = match pager.next_page(self.storage.as_ref()).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    self.error(stats, &e, "failed to list queued executions");
                    break;
                }
            };
            for execution in page {
                stats.stuck += 1;
                self.report_stuck(&execution, now).await;
            }
        }
    }

    async fn report_stuck(&self, execution: &ExecutionInstance, now: DateTime<Utc>) {
        warn!(
            execution_id = %execution.id,
            unit_id = %execution.unit_id,
            status = %execution.status,
            since = %execution.status_changed_at,
            "execution stuck"
        );
        metrics::record_stuck(execution);
        self.events
            .emit(Event::ExecutionStuck {
                execution_id: execution.id.clone(),
                unit_id: execution.unit_id.clone(),
                status: execution.status,
                timestamp: now,
            })
            .await;
    }

    async fn sweep_disabled_units(&self, now: DateTime<Utc>, stats: &mut MonitorStats) {
        let mut pager = ExecutionPager::new(
            ExecutionFilter::with_statuses(&ExecutionStatus::IN_FLIGHT),
            self.config.page_size,
        );
        let mut units: HashMap<UnitId, CachedUnit> = HashMap::new();

        loop {
            let page = match pager.next_page(self.storage.as_ref()).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    self.error(stats, &e, "failed to list in-flight executions");
                    break;
                }
            };

            for execution in page {
                stats.scanned += 1;
                if !units.contains_key(&execution.unit_id) {
                    let lookup = match self.storage.get_unit(&execution.unit_id).await {
                        Ok(unit) => CachedUnit::Found(unit),
                        Err(StorageError::NotFound(_)) => CachedUnit::Missing,
                        Err(e) => {
                            self.error(stats, &e, "failed to load unit");
                            continue;
                        }
                    };
                    units.insert(execution.unit_id.clone(), lookup);
                }
                let Some(cached) = units.get(&execution.unit_id) else {
                    continue;
                };

                match cached {
                    CachedUnit::Missing => {
                        stats.inconsistent += 1;
                        warn!(
                            execution_id = %execution.id,
                            unit_id = %execution.unit_id,
                            "execution references a missing unit"
                        );
                    }
                    CachedUnit::Found(unit) if unit.active => {}
                    CachedUnit::Found(_) if execution.status == ExecutionStatus::Scheduled => {
                        self.cancel(&execution, now, stats).await;
                    }
                    CachedUnit::Found(_) => {
                        stats.flagged += 1;
                        warn!(
                            execution_id = %execution.id,
                            unit_id = %execution.unit_id,
                            status = %execution.status,
                            worker_id = ?execution.worker_id,
                            "claimed execution of disabled unit left to finish"
                        );
                    }
                }
            }
        }
    }

    async fn cancel(&self, execution: &ExecutionInstance, now: DateTime<Utc>, stats: &mut MonitorStats) {
        let update = ExecutionUpdate::new(now).status(ExecutionStatus::Canceled);
        let condition = ExecutionCondition::status(ExecutionStatus::Scheduled);
        match self
            .storage
            .update_execution(&execution.id, &update, &condition)
            .await
        {
            Ok(0) => {
                stats.lost_races += 1;
                debug!(execution_id = %execution.id, "queued execution changed concurrently");
            }
            Ok(_) => {
                stats.canceled += 1;
                info!(
                    execution_id = %execution.id,
                    unit_id = %execution.unit_id,
                    "canceled queued execution of disabled unit"
                );
                metrics::record_canceled(execution);
                self.events
                    .emit(Event::ExecutionCanceled {
                        execution_id: execution.id.clone(),
                        unit_id: execution.unit_id.clone(),
                        timestamp: now,
                    })
                    .await;
            }
            Err(e) => self.error(stats, &e, "failed to cancel execution"),
        }
    }

    /// Delete terminal executions created before `cutoff`, per unit, keeping
    /// everything from the unit's latest successful full iteration onward.
    async fn enforce_retention(&self, cutoff: DateTime<Utc>, stats: &mut MonitorStats) {
        let mut pager = UnitPager::new(UnitFilter::default(), self.config.page_size);

        loop {
            let page = match pager.next_page(self.storage.as_ref()).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    self.error(stats, &e, "failed to list units for retention");
                    break;
                }
            };

            for unit in page {
                match self.prune_unit(&unit.id, cutoff).await {
                    Ok(0) => {}
                    Ok(deleted) => {
                        stats.deleted += deleted;
                        metrics::record_deleted(deleted);
                        debug!(unit_id = %unit.id, deleted, "pruned terminal executions");
                    }
                    Err(e) => self.error(stats, &e, "failed to prune executions"),
                }
            }
        }
    }

    /// Delete old terminal executions of a unit. Failures the retry sweep
    /// would still pick up are kept until they run out of attempts.
    async fn prune_unit(&self, unit_id: &UnitId, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let protect_from = self.protected_from(unit_id).await?;
        let old = |statuses: &[ExecutionStatus]| {
            ExecutionFilter {
                created_before: Some(cutoff),
                iteration_ts_before: protect_from,
                ..ExecutionFilter::with_statuses(statuses)
            }
            .for_unit(unit_id)
        };
        let settled: Vec<ExecutionStatus> = ExecutionStatus::TERMINAL
            .into_iter()
            .filter(|s| *s != ExecutionStatus::Failure)
            .collect();

        let mut deleted = self.storage.delete_executions(&old(&settled)).await?;
        let exhausted = ExecutionFilter {
            attempts_exhausted: true,
            ..old(&[ExecutionStatus::Failure])
        };
        deleted += self.storage.delete_executions(&exhausted).await?;
        Ok(deleted)
    }

    /// Iteration ts from which a unit's executions are kept: its latest
    /// successful full iteration, or failing that its latest success.
    async fn protected_from(&self, unit_id: &UnitId) -> Result<Option<DateTime<Utc>>, StorageError> {
        let latest = |partial: Option<bool>| ExecutionFilter {
            partial,
            order: ExecutionOrder::IterationDesc,
            ..ExecutionFilter::with_statuses(&[ExecutionStatus::Success]).for_unit(unit_id)
        };

        for filter in [latest(Some(false)), latest(None)] {
            let found = self
                .storage
                .list_executions(&filter, PageRequest::first(1))
                .await?;
            if let Some(execution) = found.first() {
                return Ok(Some(execution.iteration_ts));
            }
        }
        Ok(None)
    }

    fn error(&self, stats: &mut MonitorStats, error: &StorageError, message: &'static str) {
        stats.errors += 1;
        metrics::record_sweep_failure(SWEEP);
        warn!(error = %error, "{}", message);
    }
}

#[async_trait]
impl Sweep for StuckMonitor {
    fn name(&self) -> &'static str {
        SWEEP
    }

    fn lock_name(&self) -> &'static str {
        names::MONITOR
    }

    async fn run_once(&self) -> SweepReport {
        SweepReport::Monitor(self.tick().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Iteration, IterationId};
    use crate::storage::InMemoryStorage;
    use crate::testing::{ManualClock, RecordingHandler};
    use chrono::TimeZone;

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        clock: Arc<ManualClock>,
        events: Arc<EventBus>,
        recorder: Arc<RecordingHandler>,
    }

    impl Fixture {
        async fn new() -> Self {
            let events = Arc::new(EventBus::new());
            let recorder = Arc::new(RecordingHandler::new());
            events.register(recorder.clone()).await;
            Self {
                storage: Arc::new(InMemoryStorage::new()),
                clock: Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())),
                events,
                recorder,
            }
        }

        fn monitor(&self, config: MonitorConfig) -> StuckMonitor {
            StuckMonitor::new(self.storage.clone(), self.clock.clone(), self.events.clone(), config)
        }

        async fn unit(&self, id: &str, active: bool) {
            self.storage
                .insert_unit(SchedulableUnit::new(id, "t1", "github", 60).with_active(active))
                .await
                .unwrap();
        }

        async fn execution(
            &self,
            unit: &str,
            status: ExecutionStatus,
            partial: bool,
            iteration_ts: DateTime<Utc>,
        ) -> ExecutionInstance {
            let now = self.clock.now();
            let execution = ExecutionInstance::new(
                unit,
                "t1",
                "github",
                &Iteration::new(IterationId::new(), iteration_ts),
                partial,
                now,
            )
            .with_status(status, now);
            self.storage.insert_execution(execution.clone()).await.unwrap();
            execution
        }

        async fn status(&self, execution: &ExecutionInstance) -> Option<ExecutionStatus> {
            self.storage
                .get_execution(&execution.id)
                .await
                .ok()
                .map(|e| e.status)
        }
    }

    #[tokio::test]
    async fn test_queue_stuck_is_flagged_not_corrected() {
        let fx = Fixture::new().await;
        fx.unit("u1", true).await;
        let queued = fx
            .execution("u1", ExecutionStatus::Scheduled, false, fx.clock.now())
            .await;
        let monitor = fx.monitor(MonitorConfig::default());

        fx.clock.advance(Duration::minutes(59));
        assert_eq!(monitor.tick().await.stuck, 0);

        fx.clock.advance(Duration::minutes(2));
        assert_eq!(monitor.tick().await.stuck, 1);
        assert_eq!(fx.status(&queued).await, Some(ExecutionStatus::Scheduled));
        assert!(
            fx.recorder
                .events()
                .await
                .iter()
                .any(|e| matches!(e, Event::ExecutionStuck { .. }))
        );
    }

    #[tokio::test]
    async fn test_disabled_unit_queued_work_is_canceled_claimed_is_flagged() {
        let fx = Fixture::new().await;
        fx.unit("off", false).await;
        fx.unit("on", true).await;
        let now = fx.clock.now();
        let queued = fx.execution("off", ExecutionStatus::Scheduled, false, now).await;
        let claimed = fx.execution("off", ExecutionStatus::Pending, false, now).await;
        let healthy = fx.execution("on", ExecutionStatus::Scheduled, false, now).await;

        let stats = fx.monitor(MonitorConfig::default()).tick().await;

        assert_eq!(stats.canceled, 1);
        assert_eq!(stats.flagged, 1);
        assert_eq!(fx.status(&queued).await, Some(ExecutionStatus::Canceled));
        assert_eq!(fx.status(&claimed).await, Some(ExecutionStatus::Pending));
        assert_eq!(fx.status(&healthy).await, Some(ExecutionStatus::Scheduled));
    }

    #[tokio::test]
    async fn test_missing_unit_is_inconsistency_left_as_is() {
        let fx = Fixture::new().await;
        let orphan = fx
            .execution("ghost", ExecutionStatus::Scheduled, false, fx.clock.now())
            .await;

        let stats = fx.monitor(MonitorConfig::default()).tick().await;

        assert_eq!(stats.inconsistent, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(fx.status(&orphan).await, Some(ExecutionStatus::Scheduled));
    }

    #[tokio::test]
    async fn test_retention_keeps_latest_full_success_onward() {
        let fx = Fixture::new().await;
        fx.unit("u1", true).await;
        let t0 = fx.clock.now();
        let old_failure = ExecutionInstance::new(
            "u1",
            "t1",
            "github",
            &Iteration::new(IterationId::new(), t0),
            false,
            t0,
        )
        .with_status(ExecutionStatus::Failure, t0)
        .with_max_attempts(3)
        .with_attempts(3);
        fx.storage.insert_execution(old_failure.clone()).await.unwrap();
        let retryable = fx.execution("u1", ExecutionStatus::Failure, false, t0).await;
        let full = fx
            .execution("u1", ExecutionStatus::Success, false, t0 + Duration::minutes(1))
            .await;
        let partial = fx
            .execution("u1", ExecutionStatus::Success, true, t0 + Duration::minutes(2))
            .await;
        let in_flight = fx
            .execution("u1", ExecutionStatus::Accepted, true, t0 - Duration::minutes(1))
            .await;

        fx.clock.advance(Duration::days(10));
        let stats = fx
            .monitor(MonitorConfig {
                retention: Some(Duration::days(7)),
                queued_stuck_threshold: None,
                ..Default::default()
            })
            .tick()
            .await;

        assert_eq!(stats.deleted, 1);
        assert_eq!(fx.status(&old_failure).await, None);
        assert_eq!(fx.status(&retryable).await, Some(ExecutionStatus::Failure));
        assert_eq!(fx.status(&full).await, Some(ExecutionStatus::Success));
        assert_eq!(fx.status(&partial).await, Some(ExecutionStatus::Success));
        assert_eq!(fx.status(&in_flight).await, Some(ExecutionStatus::Accepted));
    }

    #[tokio::test]
    async fn test_retention_disabled_deletes_nothing() {
        let fx = Fixture::new().await;
        fx.unit("u1", true).await;
        let old = fx
            .execution("u1", ExecutionStatus::Aborted, false, fx.clock.now())
            .await;

        fx.clock.advance(Duration::days(365));
        let stats = fx.monitor(MonitorConfig::default()).tick().await;

        assert_eq!(stats.deleted, 0);
        assert_eq!(fx.status(&old).await, Some(ExecutionStatus::Aborted));
    }

    #[tokio::test]
    async fn test_huge_thresholds_skip_their_passes() {
        let fx = Fixture::new().await;
        fx.unit("u1", true).await;
        fx.unit("off", false).await;
        let now = fx.clock.now();
        let queued = fx.execution("u1", ExecutionStatus::Scheduled, false, now).await;
        let done = fx.execution("u1", ExecutionStatus::Aborted, false, now).await;
        let disabled = fx.execution("off", ExecutionStatus::Scheduled, false, now).await;

        fx.clock.advance(Duration::days(365));
        let stats = fx
            .monitor(MonitorConfig {
                queued_stuck_threshold: Some(Duration::MAX),
                retention: Some(Duration::MAX),
                ..Default::default()
            })
            .tick()
            .await;

        assert_eq!(stats.stuck, 0);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.canceled, 1);
        assert_eq!(fx.status(&queued).await, Some(ExecutionStatus::Scheduled));
        assert_eq!(fx.status(&done).await, Some(ExecutionStatus::Aborted));
        assert_eq!(fx.status(&disabled).await, Some(ExecutionStatus::Canceled));
    }
}
