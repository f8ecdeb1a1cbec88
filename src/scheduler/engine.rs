//! Scheduling loop: turns due units into SCHEDULED executions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::backpressure::BackpressureEvaluator;
use super::pool::DispatchPool;
use super::types::{SchedulingStats, SweepReport};
use super::Sweep;
use crate::core::{Clock, DueKind, ExecutionInstance, Iteration, SchedulableUnit};
use crate::events::{Event, EventBus};
use crate::lock::names;
use crate::metrics;
use crate::registry::UnitTypeRegistry;
use crate::storage::{Storage, UnitCondition, UnitFilter, UnitPager, UnitUpdate};

const SWEEP: &str = "scheduling";

/// Settings of the scheduling loop.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    /// Units per storage page.
    pub page_size: usize,
    /// Concurrent execution creations.
    pub pool_size: usize,
    /// How long a tick waits for its creations. `None` waits for all.
    pub dispatch_timeout: Option<Duration>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            pool_size: 8,
            dispatch_timeout: Some(Duration::from_secs(60)),
        }
    }
}

enum Creation {
    Created,
    Backpressured,
    LostRace,
    Failed,
}

/// Creates one execution for a due unit.
#[derive(Clone)]
struct Creator {
    storage: Arc<dyn Storage>,
    registry: Arc<UnitTypeRegistry>,
    backpressure: BackpressureEvaluator,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl Creator {
    /// Check backpressure, advance the unit, then insert. The unit update is
    /// guarded by the `last_iteration_ts` we read, so of two racing creators
    /// only one inserts.
    async fn create(&self, unit: SchedulableUnit, kind: DueKind) -> Creation {
        let now = self.clock.now();
        match self.backpressure.is_backpressured(&unit).await {
            Ok(false) => {}
            Ok(true) => {
                debug!(unit_id = %unit.id, "unit back-pressured, skipping");
                metrics::record_backpressured(&unit);
                self.events
                    .emit(Event::UnitBackpressured {
                        unit_id: unit.id.clone(),
                        timestamp: now,
                    })
                    .await;
                return Creation::Backpressured;
            }
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "backpressure check failed");
                metrics::record_sweep_failure(SWEEP);
                return Creation::Failed;
            }
        }

        let policy = self.registry.resolve(&unit);
        let iteration = Iteration::next_after(unit.last_iteration.as_ref(), now);
        let partial = kind.is_partial();

        let claimed = self
            .storage
            .update_unit(
                &unit.id,
                &UnitUpdate::advance(now, iteration.clone(), !partial),
                &UnitCondition::last_iteration_ts(unit.last_iteration_ts()),
            )
            .await;
        match claimed {
            Ok(0) => {
                debug!(unit_id = %unit.id, "unit advanced concurrently, skipping");
                return Creation::LostRace;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "failed to advance unit");
                metrics::record_sweep_failure(SWEEP);
                return Creation::Failed;
            }
        }

        let mut execution = ExecutionInstance::new(
            unit.id.clone(),
            unit.tenant_id.clone(),
            unit.unit_type.clone(),
            &iteration,
            partial,
            now,
        )
        .schedule(now);
        execution.integration_id = unit.integration_id.clone();
        execution.retry_class = policy.retry_class;
        execution.max_attempts = policy.max_attempts;
        execution.retry_wait_secs = policy.retry_wait_secs;
        execution.timeout_secs = policy.timeout_secs;
        execution.priority = unit.priority;
        let execution_id = execution.id.clone();

        if let Err(e) = self.storage.insert_execution(execution).await {
            // The unit has moved on; this iteration gets no execution.
            warn!(
                unit_id = %unit.id,
                iteration_id = %iteration.id,
                error = %e,
                "failed to insert execution for advanced unit"
            );
            metrics::record_sweep_failure(SWEEP);
            return Creation::Failed;
        }

        metrics::record_scheduled(&unit, partial);
        info!(
            unit_id = %unit.id,
            execution_id = %execution_id,
            iteration_id = %iteration.id,
            partial,
            "execution scheduled"
        );
        self.events
            .emit(Event::ExecutionScheduled {
                execution_id,
                unit_id: unit.id.clone(),
                iteration_id: iteration.id,
                partial,
                timestamp: now,
            })
            .await;
        Creation::Created
    }
}

/// Periodic sweep that schedules due, non-back-pressured units.
pub struct SchedulingLoop {
    creator: Creator,
    pool: DispatchPool,
    config: SchedulingConfig,
}

impl SchedulingLoop {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<UnitTypeRegistry>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        config: SchedulingConfig,
    ) -> Self {
        Self {
            pool: DispatchPool::new(config.pool_size),
            creator: Creator {
                backpressure: BackpressureEvaluator::new(Arc::clone(&storage), Arc::clone(&registry)),
                storage,
                registry,
                clock,
                events,
            },
            config,
        }
    }

    pub fn pool(&self) -> &DispatchPool {
        &self.pool
    }

    /// Run one scheduling pass.
    pub async fn tick(&self) -> SchedulingStats {
        let now = self.creator.clock.now();
        let mut stats = SchedulingStats::default();
        let mut pager = UnitPager::new(UnitFilter::active(), self.config.page_size);
        let mut batch = self.pool.batch();

        loop {
            let page = match pager.next_page(self.creator.storage.as_ref()).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to list units, ending scan early");
                    metrics::record_sweep_failure(SWEEP);
                    stats.failed += 1;
                    break;
                }
            };

            for unit in page {
                stats.scanned += 1;
                let Some(kind) = unit.due(now) else {
                    continue;
                };
                stats.schedulable += 1;
                stats.dispatched += 1;
                let creator = self.creator.clone();
                batch.spawn(async move { creator.create(unit, kind).await });
            }
        }

        let outcome = batch.join(self.config.dispatch_timeout).await;
        for creation in outcome.results {
            match creation {
                Creation::Created => stats.created += 1,
                Creation::Backpressured => stats.backpressured += 1,
                Creation::LostRace => stats.lost_races += 1,
                Creation::Failed => stats.failed += 1,
            }
        }
        stats.failed += outcome.panicked;
        stats.detached = outcome.detached;
        if stats.detached > 0 {
            warn!(
                detached = stats.detached,
                "dispatch timeout reached, creations left running"
            );
        }

        metrics::set_scanned(SWEEP, stats.scanned);
        info!(
            scanned = stats.scanned,
            schedulable = stats.schedulable,
            backpressured = stats.backpressured,
            dispatched = stats.dispatched,
            created = stats.created,
            failed = stats.failed,
            "scheduling tick finished"
        );
        stats
    }
}

#[async_trait]
impl Sweep for SchedulingLoop {
    fn name(&self) -> &'static str {
        SWEEP
    }

    fn lock_name(&self) -> &'static str {
        names::SCHEDULING
    }

    async fn run_once(&self) -> SweepReport {
        SweepReport::Scheduling(self.tick().await)
    }
}
