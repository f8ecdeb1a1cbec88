use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Lease, LockService};
use crate::core::Clock;
use crate::storage::StorageError;

/// Process-local lease table. Suitable for tests and single-replica setups.
pub struct InMemoryLockService {
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StorageError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(current) = leases.get(name) {
            if current.holder != holder && current.expires_at > now {
                return Ok(None);
            }
        }
        let lease = Lease {
            name: name.to_string(),
            holder: holder.to_string(),
            expires_at: crate::core::clock::after(now, ttl),
        };
        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, StorageError> {
        let mut leases = self.leases.lock().map_err(|_| StorageError::LockPoisoned)?;
        match leases.get(&lease.name) {
            Some(current) if current.holder == lease.holder => {
                leases.remove(&lease.name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
