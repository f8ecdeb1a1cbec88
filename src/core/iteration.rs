//! Scheduling iterations.
//!
//! Each scheduling decision for a unit is tagged with an [`Iteration`]: a
//! random id plus a timestamp. Every execution created for that decision
//! carries a copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::IterationId;

/// A logical scheduling cycle of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    /// Unique iteration identifier.
    pub id: IterationId,
    /// When the iteration was scheduled.
    pub ts: DateTime<Utc>,
}

impl Iteration {
    /// Create an iteration with an explicit id and timestamp.
    pub fn new(id: IterationId, ts: DateTime<Utc>) -> Self {
        Self { id, ts }
    }

    /// Start the iteration that follows `previous`.
    ///
    /// The timestamp is `now` truncated to milliseconds, unless that would
    /// not be strictly after the previous iteration, in which case it is the
    /// previous timestamp plus one millisecond.
    pub fn next_after(previous: Option<&Iteration>, now: DateTime<Utc>) -> Self {
        let now = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        let ts = match previous {
            Some(prev) if now <= prev.ts => prev.ts + chrono::Duration::milliseconds(1),
            _ => now,
        };
        Self {
            id: IterationId::new(),
            ts,
        }
    }
}
