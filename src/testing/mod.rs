//! Testing utilities for users of the cadence library.
//!
//! - [`ManualClock`]: a clock that only moves when told to
//! - [`RecordingHandler`]: an event handler that keeps every event
//! - [`UnitFixture`] and [`execution`]: row builders with sensible defaults

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::core::{Clock, ExecutionInstance, ExecutionStatus, Iteration, IterationId, SchedulableUnit};
use crate::events::{Event, EventHandler};

/// A clock that only moves when told to.
///
/// # Example
///
/// ```
/// use cadence::core::Clock;
/// use cadence::testing::ManualClock;
/// use chrono::{Duration, Utc};
///
/// let start = Utc::now();
/// let clock = ManualClock::new(start);
/// clock.advance(Duration::seconds(61));
/// assert_eq!(clock.now(), start + Duration::seconds(61));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Set the clock to `to`, which may be in the past.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Event handler that records every event it sees.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: AsyncMutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen so far, in emission order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Events of one kind (see [`Event::kind`]).
    pub async fn of_kind(&self, kind: &str) -> Vec<Event> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// Builder for test units: tenant `t1`, type `github`, every 60 seconds.
pub struct UnitFixture {
    unit: SchedulableUnit,
}

impl UnitFixture {
    pub fn new(id: &str) -> Self {
        Self {
            unit: SchedulableUnit::new(id, "t1", "github", 60),
        }
    }

    pub fn unit_type(mut self, unit_type: &str) -> Self {
        self.unit.unit_type = unit_type.into();
        self
    }

    pub fn every(mut self, secs: i64) -> Self {
        self.unit.frequency_secs = secs;
        self
    }

    pub fn full_every(self, secs: i64) -> Self {
        Self {
            unit: self.unit.with_full_frequency(secs),
        }
    }

    pub fn threshold(self, threshold: usize) -> Self {
        Self {
            unit: self.unit.with_backpressure_threshold(threshold),
        }
    }

    pub fn inactive(self) -> Self {
        Self {
            unit: self.unit.with_active(false),
        }
    }

    pub fn build(self) -> SchedulableUnit {
        self.unit
    }
}

/// An execution of `unit` in `status` since `at`, for a fresh iteration at `at`.
pub fn execution(
    unit: &SchedulableUnit,
    status: ExecutionStatus,
    partial: bool,
    at: DateTime<Utc>,
) -> ExecutionInstance {
    let mut execution = ExecutionInstance::new(
        unit.id.clone(),
        unit.tenant_id.clone(),
        unit.unit_type.clone(),
        &Iteration::new(IterationId::new(), at),
        partial,
        at,
    )
    .with_status(status, at);
    execution.integration_id = unit.integration_id.clone();
    execution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UnitId;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn test_recording_handler_filters_by_kind() {
        let handler = RecordingHandler::new();
        let now = Utc::now();
        handler
            .handle(&Event::UnitBackpressured {
                unit_id: UnitId::new("u1"),
                timestamp: now,
            })
            .await;
        handler
            .handle(&Event::ExecutionCanceled {
                execution_id: crate::core::ExecutionId::new(),
                unit_id: UnitId::new("u1"),
                timestamp: now,
            })
            .await;

        assert_eq!(handler.events().await.len(), 2);
        assert_eq!(handler.of_kind("canceled").await.len(), 1);

        handler.clear().await;
        assert!(handler.events().await.is_empty());
    }

    #[test]
    fn test_fixtures() {
        let unit = UnitFixture::new("u1").every(30).threshold(2).inactive().build();
        assert_eq!(unit.frequency_secs, 30);
        assert_eq!(unit.backpressure_threshold, Some(2));
        assert!(!unit.active);

        let at = Utc::now();
        let e = execution(&unit, ExecutionStatus::Failure, true, at);
        assert_eq!(e.unit_id, unit.id);
        assert_eq!(e.status_changed_at, at);
        assert!(e.partial);
    }
}
