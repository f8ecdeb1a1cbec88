//! Backpressure evaluation.

use std::sync::Arc;

use crate::core::{ExecutionStatus, SchedulableUnit};
use crate::registry::UnitTypeRegistry;
use crate::storage::{ExecutionFilter, Storage, StorageError};

/// Decides whether a unit already has too much outstanding work.
///
/// A unit is back-pressured when it has `threshold` executions in flight, or
/// `threshold` failed executions that will still be retried. Both counts stop
/// at `threshold`, so the check costs O(threshold) rows whatever the history.
#[derive(Clone)]
pub struct BackpressureEvaluator {
    storage: Arc<dyn Storage>,
    registry: Arc<UnitTypeRegistry>,
}

impl BackpressureEvaluator {
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<UnitTypeRegistry>) -> Self {
        Self { storage, registry }
    }

    pub async fn is_backpressured(&self, unit: &SchedulableUnit) -> Result<bool, StorageError> {
        let threshold = self.registry.threshold(unit);

        let in_flight = ExecutionFilter::with_statuses(&ExecutionStatus::IN_FLIGHT).for_unit(&unit.id);
        if self.storage.count_executions(&in_flight, threshold).await? >= threshold {
            return Ok(true);
        }

        let retryable = ExecutionFilter {
            below_max_attempts: true,
            ..ExecutionFilter::with_statuses(&[ExecutionStatus::Failure])
        }
        .for_unit(&unit.id);
        Ok(self.storage.count_executions(&retryable, threshold).await? >= threshold)
    }
}
