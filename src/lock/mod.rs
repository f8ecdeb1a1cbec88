//! Short-lived named leases.
//!
//! Each sweep runs under a lease named after it, so that among several
//! replicas only one runs a given sweep per tick. A lease expires on its
//! own after its TTL, which covers a holder that crashes mid-sweep.

mod memory;

pub use memory::InMemoryLockService;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, warn};

use crate::storage::StorageError;

/// Lease names used by the sweeps.
pub mod names {
    pub const SCHEDULING: &str = "cadence.scheduling";
    pub const RETRY: &str = "cadence.retry";
    pub const MONITOR: &str = "cadence.monitor";
}

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Named mutual exclusion with expiry.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take the lease `name` for `holder` unless another holder has an
    /// unexpired lease on it. The same holder may re-take its own lease.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StorageError>;

    /// Release a lease. Returns false when it had already expired and been taken over.
    async fn release(&self, lease: &Lease) -> Result<bool, StorageError>;
}

/// Run `body` while holding the lease `name`.
///
/// Returns `None` without running `body` when the lease is held elsewhere
/// or cannot be taken. The lease is released after `body` completes, and
/// also when it panics, in which case `None` is returned.
pub async fn run_exclusive<F, Fut, T>(
    locks: &dyn LockService,
    name: &str,
    holder: &str,
    ttl: Duration,
    body: F,
) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let lease = match locks.try_acquire(name, holder, ttl).await {
        Ok(Some(lease)) => lease,
        Ok(None) => {
            debug!(lock = name, "lock held by another instance, skipping tick");
            return None;
        }
        Err(e) => {
            warn!(lock = name, error = %e, "failed to acquire lock, skipping tick");
            return None;
        }
    };

    let output = AssertUnwindSafe(body()).catch_unwind().await;

    match locks.release(&lease).await {
        Ok(true) => {}
        Ok(false) => warn!(lock = name, "lock expired before release"),
        Err(e) => warn!(lock = name, error = %e, "failed to release lock"),
    }
    match output {
        Ok(output) => Some(output),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(lock = name, panic = %message, "locked body panicked");
            None
        }
    }
}
