//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{
    ExecutionCondition, ExecutionFilter, ExecutionOrder, ExecutionUpdate, PageRequest, Storage,
    StorageError, UnitCondition, UnitFilter, UnitUpdate,
};
use crate::core::{ExecutionId, ExecutionInstance, Iteration, IterationId, SchedulableUnit, UnitId};

/// In-memory storage backend.
///
/// Units live in a `BTreeMap` so listings come out in id order. Each
/// conditional update checks and writes under one write lock.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    units: RwLock<BTreeMap<UnitId, SchedulableUnit>>,
    executions: RwLock<HashMap<ExecutionId, ExecutionInstance>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            units: RwLock::new(BTreeMap::new()),
            executions: RwLock::new(HashMap::new()),
        }
    }

    fn matching(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        let executions = self
            .executions
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = executions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        match filter.order {
            ExecutionOrder::IdAsc => result.sort_by(|a, b| a.id.cmp(&b.id)),
            ExecutionOrder::IterationAsc => result.sort_by(|a, b| {
                a.iteration_ts.cmp(&b.iteration_ts).then_with(|| a.id.cmp(&b.id))
            }),
            ExecutionOrder::IterationDesc => result.sort_by(|a, b| {
                b.iteration_ts.cmp(&a.iteration_ts).then_with(|| a.id.cmp(&b.id))
            }),
        }
        Ok(result)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn paginate<T>(rows: Vec<T>, page: PageRequest) -> Vec<T> {
    rows.into_iter().skip(page.offset).take(page.limit).collect()
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_unit(&self, unit: SchedulableUnit) -> Result<(), StorageError> {
        let mut units = self.units.write().map_err(|_| StorageError::LockPoisoned)?;
        if units.contains_key(&unit.id) {
            return Err(StorageError::DuplicateKey(format!("unit: {}", unit.id)));
        }
        units.insert(unit.id.clone(), unit);
        Ok(())
    }

    async fn get_unit(&self, id: &UnitId) -> Result<SchedulableUnit, StorageError> {
        let units = self.units.read().map_err(|_| StorageError::LockPoisoned)?;
        units
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("unit: {}", id)))
    }

    async fn list_units(
        &self,
        filter: &UnitFilter,
        page: PageRequest,
    ) -> Result<Vec<SchedulableUnit>, StorageError> {
        let units = self.units.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(units
            .values()
            .filter(|u| filter.matches(u))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn update_unit(
        &self,
        id: &UnitId,
        update: &UnitUpdate,
        condition: &UnitCondition,
    ) -> Result<u64, StorageError> {
        let mut units = self.units.write().map_err(|_| StorageError::LockPoisoned)?;
        let Some(unit) = units.get_mut(id) else {
            return Ok(0);
        };
        if !condition.matches(unit) {
            return Ok(0);
        }
        if let Some(active) = update.active {
            unit.active = active;
        }
        if let Some(iteration) = &update.last_iteration {
            unit.last_iteration = Some(iteration.clone());
        }
        if let Some(ts) = update.last_full_iteration_ts {
            unit.last_full_iteration_ts = Some(ts);
        }
        unit.updated_at = update.now;
        Ok(1)
    }

    async fn insert_execution(&self, execution: ExecutionInstance) -> Result<(), StorageError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if executions.contains_key(&execution.id) {
            return Err(StorageError::DuplicateKey(format!(
                "execution: {}",
                execution.id
            )));
        }
        executions.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInstance, StorageError> {
        let executions = self
            .executions
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        executions
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("execution: {}", id)))
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: PageRequest,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        Ok(paginate(self.matching(filter)?, page))
    }

    async fn count_executions(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> Result<usize, StorageError> {
        let executions = self
            .executions
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(executions
            .values()
            .filter(|e| filter.matches(e))
            .take(limit)
            .count())
    }

    async fn update_execution(
        &self,
        id: &ExecutionId,
        update: &ExecutionUpdate,
        condition: &ExecutionCondition,
    ) -> Result<u64, StorageError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let Some(execution) = executions.get_mut(id) else {
            return Ok(0);
        };
        if !condition.matches(execution) {
            return Ok(0);
        }
        update.apply(execution);
        Ok(1)
    }

    async fn delete_executions(&self, filter: &ExecutionFilter) -> Result<u64, StorageError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let before = executions.len();
        executions.retain(|_, e| !filter.matches(e));
        Ok((before - executions.len()) as u64)
    }

    async fn list_iterations(
        &self,
        unit_id: &UnitId,
        page: PageRequest,
    ) -> Result<Vec<Iteration>, StorageError> {
        let executions = self
            .executions
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut seen: HashMap<IterationId, Iteration> = HashMap::new();
        for e in executions.values().filter(|e| &e.unit_id == unit_id) {
            seen.entry(e.iteration_id.clone())
                .or_insert_with(|| e.iteration());
        }
        let mut iterations: Vec<_> = seen.into_values().collect();
        iterations.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(iterations, page))
    }
}
