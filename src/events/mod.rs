//! Orchestration events and event handling.
//!
//! Sweeps and the worker gateway emit an [`Event`] for every decision they
//! make on an execution. Handlers are registered on the [`EventBus`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

use crate::core::{ExecutionId, ExecutionStatus, IterationId, UnitId};

/// Why an execution was put back in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// It failed and its backoff elapsed.
    Failed,
    /// The worker holding it is gone.
    Orphaned,
    /// It exceeded the assigned-job timeout.
    Stale,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryReason::Failed => "failed",
            RetryReason::Orphaned => "orphaned",
            RetryReason::Stale => "stale",
        })
    }
}

/// Lifecycle events emitted by orchestration decisions.
#[derive(Debug, Clone)]
pub enum Event {
    /// The scheduling loop created an execution.
    ExecutionScheduled {
        execution_id: ExecutionId,
        unit_id: UnitId,
        iteration_id: IterationId,
        partial: bool,
        timestamp: DateTime<Utc>,
    },

    /// A due unit was skipped because of backpressure.
    UnitBackpressured {
        unit_id: UnitId,
        timestamp: DateTime<Utc>,
    },

    /// The retry engine moved an execution back to SCHEDULED.
    ExecutionRetried {
        execution_id: ExecutionId,
        unit_id: UnitId,
        /// Attempts made so far.
        attempt: u32,
        reason: RetryReason,
        timestamp: DateTime<Utc>,
    },

    /// A timed-out execution had no attempts left and was failed for good.
    ExecutionExhausted {
        execution_id: ExecutionId,
        unit_id: UnitId,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// An execution has been sitting in a status for too long.
    ExecutionStuck {
        execution_id: ExecutionId,
        unit_id: UnitId,
        status: ExecutionStatus,
        timestamp: DateTime<Utc>,
    },

    /// A queued execution of a disabled unit was canceled.
    ExecutionCanceled {
        execution_id: ExecutionId,
        unit_id: UnitId,
        timestamp: DateTime<Utc>,
    },

    /// A worker reported a terminal status.
    ExecutionFinished {
        execution_id: ExecutionId,
        unit_id: UnitId,
        status: ExecutionStatus,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::ExecutionScheduled { timestamp, .. }
            | Event::UnitBackpressured { timestamp, .. }
            | Event::ExecutionRetried { timestamp, .. }
            | Event::ExecutionExhausted { timestamp, .. }
            | Event::ExecutionStuck { timestamp, .. }
            | Event::ExecutionCanceled { timestamp, .. }
            | Event::ExecutionFinished { timestamp, .. } => *timestamp,
        }
    }

    /// Unit the event is about.
    pub fn unit_id(&self) -> &UnitId {
        match self {
            Event::ExecutionScheduled { unit_id, .. }
            | Event::UnitBackpressured { unit_id, .. }
            | Event::ExecutionRetried { unit_id, .. }
            | Event::ExecutionExhausted { unit_id, .. }
            | Event::ExecutionStuck { unit_id, .. }
            | Event::ExecutionCanceled { unit_id, .. }
            | Event::ExecutionFinished { unit_id, .. } => unit_id,
        }
    }

    /// Short name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ExecutionScheduled { .. } => "scheduled",
            Event::UnitBackpressured { .. } => "backpressured",
            Event::ExecutionRetried { .. } => "retried",
            Event::ExecutionExhausted { .. } => "exhausted",
            Event::ExecutionStuck { .. } => "stuck",
            Event::ExecutionCanceled { .. } => "canceled",
            Event::ExecutionFinished { .. } => "finished",
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        trace!(event = event.kind(), unit_id = %event.unit_id(), "emitting event");
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHandler;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Test handler that counts events.
    struct CountingHandler {
        count: AtomicU32,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                count: AtomicU32::new(0),
            }
        }

        fn count(&self) -> u32 {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn canceled(unit: &str) -> Event {
        Event::ExecutionCanceled {
            execution_id: ExecutionId::new(),
            unit_id: UnitId::new(unit),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_recorder() {
        let handler = Arc::new(RecordingHandler::new());
        let bus = EventBus::new();
        bus.register(handler.clone()).await;

        bus.emit(Event::ExecutionRetried {
            execution_id: ExecutionId::new(),
            unit_id: UnitId::new("jira-1"),
            attempt: 2,
            reason: RetryReason::Orphaned,
            timestamp: Utc::now(),
        })
        .await;

        let events = handler.events().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::ExecutionRetried {
                unit_id,
                attempt,
                reason,
                ..
            } => {
                assert_eq!(unit_id.as_str(), "jira-1");
                assert_eq!(*attempt, 2);
                assert_eq!(*reason, RetryReason::Orphaned);
            }
            _ => panic!("Expected ExecutionRetried event"),
        }
    }

    #[tokio::test]
    async fn test_multiple_handlers_receive_same_event() {
        let handler1 = Arc::new(CountingHandler::new());
        let handler2 = Arc::new(CountingHandler::new());

        let bus = EventBus::new();
        bus.register(handler1.clone()).await;
        bus.register(handler2.clone()).await;
        assert_eq!(bus.handler_count().await, 2);

        bus.emit(canceled("u1")).await;

        assert_eq!(handler1.count(), 1);
        assert_eq!(handler2.count(), 1);
    }

    #[tokio::test]
    async fn test_no_handlers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(canceled("u1")).await;
    }

    #[test]
    fn test_event_accessors() {
        let event = canceled("u9");
        assert_eq!(event.kind(), "canceled");
        assert_eq!(event.unit_id().as_str(), "u9");
        assert!(event.timestamp() <= Utc::now());
    }
}
