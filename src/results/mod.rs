//! Iteration history and result aggregation.
//!
//! A consumer asking for a unit's results gets either the single latest
//! success (partial allowed) or a consistent view: the latest successful
//! full scan plus every success after it, oldest first.

mod callback;

pub use callback::{
    CallbackDispatcher, CallbackEnvelope, CallbackError, CallbackJob, HttpCallback, ResultNotifier,
};

use std::sync::Arc;

use crate::core::{ExecutionInstance, ExecutionStatus, Iteration, IterationId, UnitId};
use crate::storage::{ExecutionFilter, ExecutionOrder, PageRequest, Storage, StorageError};

/// Read-side queries over executions.
#[derive(Clone)]
pub struct ResultAggregator {
    storage: Arc<dyn Storage>,
    page_size: usize,
}

impl ResultAggregator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            page_size: 100,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Successful executions to present for `unit_id`.
    ///
    /// With `allow_partial`, the most recent success of either kind. Without,
    /// every success from the latest full success onward in iteration order,
    /// or nothing when the unit has no full success yet.
    pub async fn latest_results(
        &self,
        unit_id: &UnitId,
        allow_partial: bool,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        let successes = ExecutionFilter::with_statuses(&[ExecutionStatus::Success]).for_unit(unit_id);

        if allow_partial {
            let filter = ExecutionFilter {
                order: ExecutionOrder::IterationDesc,
                ..successes
            };
            return self.storage.list_executions(&filter, PageRequest::first(1)).await;
        }

        let latest_full = ExecutionFilter {
            partial: Some(false),
            order: ExecutionOrder::IterationDesc,
            ..successes.clone()
        };
        let Some(anchor) = self
            .storage
            .list_executions(&latest_full, PageRequest::first(1))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(Vec::new());
        };

        let since = ExecutionFilter {
            iteration_ts_at_or_after: Some(anchor.iteration_ts),
            order: ExecutionOrder::IterationAsc,
            ..successes
        };
        self.collect(&since).await
    }

    /// Distinct iterations of a unit, newest first.
    pub async fn list_iterations(
        &self,
        unit_id: &UnitId,
        page: PageRequest,
    ) -> Result<Vec<Iteration>, StorageError> {
        self.storage.list_iterations(unit_id, page).await
    }

    /// Every execution created for `iteration_id`.
    pub async fn executions_for_iteration(
        &self,
        iteration_id: &IterationId,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        let filter = ExecutionFilter {
            iteration_id: Some(iteration_id.clone()),
            ..Default::default()
        };
        self.collect(&filter).await
    }

    // Read-only, so offset paging is stable enough here.
    async fn collect(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionInstance>, StorageError> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .storage
                .list_executions(filter, PageRequest::new(offset, self.page_size))
                .await?;
            let len = page.len();
            all.extend(page);
            if len < self.page_size {
                return Ok(all);
            }
            offset += len;
        }
    }
}
