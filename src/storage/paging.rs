//! Keyset pagers for sweeps.
//!
//! Sweeps mutate the rows they enumerate, which shifts offset pages under
//! them. These pagers page on the id instead: each page starts strictly
//! after the last id returned.

use super::{ExecutionFilter, ExecutionOrder, PageRequest, Storage, StorageError, UnitFilter};
use crate::core::{ExecutionInstance, SchedulableUnit};

/// Pages through units in id order.
pub struct UnitPager {
    filter: UnitFilter,
    page_size: usize,
    done: bool,
}

impl UnitPager {
    pub fn new(filter: UnitFilter, page_size: usize) -> Self {
        Self {
            filter,
            page_size: page_size.max(1),
            done: false,
        }
    }

    /// Fetch the next non-empty page, or `None` once exhausted.
    pub async fn next_page(
        &mut self,
        storage: &dyn Storage,
    ) -> Result<Option<Vec<SchedulableUnit>>, StorageError> {
        if self.done {
            return Ok(None);
        }
        let page = storage
            .list_units(&self.filter, PageRequest::first(self.page_size))
            .await?;
        if page.len() < self.page_size {
            self.done = true;
        }
        match page.last() {
            Some(last) => {
                self.filter.id_after = Some(last.id.clone());
                Ok(Some(page))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

/// Pages through executions in id order.
pub struct ExecutionPager {
    filter: ExecutionFilter,
    page_size: usize,
    done: bool,
}

impl ExecutionPager {
    /// The filter's order is forced to ascending id.
    pub fn new(mut filter: ExecutionFilter, page_size: usize) -> Self {
        filter.order = ExecutionOrder::IdAsc;
        Self {
            filter,
            page_size: page_size.max(1),
            done: false,
        }
    }

    /// Fetch the next non-empty page, or `None` once exhausted.
    pub async fn next_page(
        &mut self,
        storage: &dyn Storage,
    ) -> Result<Option<Vec<ExecutionInstance>>, StorageError> {
        if self.done {
            return Ok(None);
        }
        let page = storage
            .list_executions(&self.filter, PageRequest::first(self.page_size))
            .await?;
        if page.len() < self.page_size {
            self.done = true;
        }
        match page.last() {
            Some(last) => {
                self.filter.id_after = Some(last.id.clone());
                Ok(Some(page))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}
