//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use cadence::core::{ExecutionInstance, ExecutionStatus, RetryPolicyTable, UnitId};
use cadence::events::EventBus;
use cadence::monitor::{MonitorConfig, StuckMonitor};
use cadence::registry::{StaticAgentRegistry, UnitTypeRegistry};
use cadence::retry::{RetryConfig, RetryEngine};
use cadence::scheduler::{SchedulingConfig, SchedulingLoop};
use cadence::storage::{ExecutionFilter, ExecutionOrder, InMemoryStorage, PageRequest, Storage};
use cadence::testing::{ManualClock, RecordingHandler};
use cadence::worker::WorkerGateway;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

pub const AGENT: &str = "agent-a";

/// Origin of every test timeline.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Components sharing one store, one clock and one event bus.
pub struct Harness {
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<EventBus>,
    pub recorder: Arc<RecordingHandler>,
    pub registry: Arc<UnitTypeRegistry>,
    pub agents: Arc<StaticAgentRegistry>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_storage(Arc::new(InMemoryStorage::new()), UnitTypeRegistry::default()).await
    }

    pub async fn with_registry(registry: UnitTypeRegistry) -> Self {
        Self::with_storage(Arc::new(InMemoryStorage::new()), registry).await
    }

    pub async fn with_storage(storage: Arc<dyn Storage>, registry: UnitTypeRegistry) -> Self {
        let events = Arc::new(EventBus::new());
        let recorder = Arc::new(RecordingHandler::new());
        events.register(recorder.clone()).await;
        Self {
            storage,
            clock: Arc::new(ManualClock::new(epoch())),
            events,
            recorder,
            registry: Arc::new(registry),
            agents: Arc::new(StaticAgentRegistry::with_live([AGENT])),
        }
    }

    /// Set the clock to `secs` after the epoch.
    pub fn at(&self, secs: i64) {
        self.clock.set(epoch() + Duration::seconds(secs));
    }

    pub fn scheduling(&self) -> SchedulingLoop {
        SchedulingLoop::new(
            self.storage.clone(),
            self.registry.clone(),
            self.clock.clone(),
            self.events.clone(),
            SchedulingConfig::default(),
        )
    }

    pub fn retry(&self, config: RetryConfig) -> RetryEngine {
        RetryEngine::new(
            self.storage.clone(),
            self.registry.clone(),
            self.agents.clone(),
            self.clock.clone(),
            self.events.clone(),
            config,
        )
    }

    pub fn monitor(&self, config: MonitorConfig) -> StuckMonitor {
        StuckMonitor::new(
            self.storage.clone(),
            self.clock.clone(),
            self.events.clone(),
            config,
        )
    }

    pub fn gateway(&self) -> WorkerGateway {
        WorkerGateway::new(
            self.storage.clone(),
            self.registry.clone(),
            self.clock.clone(),
            self.events.clone(),
        )
    }

    /// Every execution of `unit_id`, oldest iteration first.
    pub async fn executions(&self, unit_id: &str) -> Vec<ExecutionInstance> {
        self.storage
            .list_executions(
                &ExecutionFilter {
                    order: ExecutionOrder::IterationAsc,
                    ..ExecutionFilter::default().for_unit(&UnitId::new(unit_id))
                },
                PageRequest::first(1000),
            )
            .await
            .unwrap()
    }

    /// Executions of `unit_id` in any of `statuses`.
    pub async fn count(&self, unit_id: &str, statuses: &[ExecutionStatus]) -> usize {
        self.storage
            .count_executions(
                &ExecutionFilter::with_statuses(statuses).for_unit(&UnitId::new(unit_id)),
                10_000,
            )
            .await
            .unwrap()
    }
}

/// Registry whose default class has `max_attempts` and a linear step of `step_secs`.
pub fn registry_with_attempts(max_attempts: u32, step_secs: i64) -> UnitTypeRegistry {
    UnitTypeRegistry::new(RetryPolicyTable::new(cadence::core::RetryPolicy::linear(
        "default",
        max_attempts,
        step_secs,
    )))
}
