//! Schedulable units.
//!
//! A [`SchedulableUnit`] is a recurring piece of configuration (an ingestion
//! trigger or an aggregation job definition) that the scheduling loop turns
//! into executions on a fixed cadence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clock::{age, seconds};
use super::iteration::Iteration;
use super::types::{IntegrationId, TenantId, UnitId, UnitType};

/// Dispatch priority of a unit's executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Numeric form, lower is more urgent.
    pub fn as_i64(self) -> i64 {
        match self {
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    /// Parse the numeric form. Unknown values map to `Medium`.
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Priority::High,
            3 => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// Per-unit retry parameters. Unset fields fall back to the unit type's retry class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitRetry {
    /// Maximum attempts for one execution.
    pub max_attempts: Option<u32>,
    /// Constant wait between a failure and its retry, in seconds.
    pub wait_secs: Option<i64>,
    /// Job timeout for one attempt, in seconds.
    pub timeout_secs: Option<i64>,
}

/// Which class of execution a due unit needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueKind {
    /// A complete scan.
    Full,
    /// An incremental scan since the previous iteration.
    Partial,
}

impl DueKind {
    /// Whether executions of this kind are flagged partial.
    pub fn is_partial(self) -> bool {
        self == DueKind::Partial
    }
}

/// A recurring unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulableUnit {
    /// Unique unit identifier.
    pub id: UnitId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Integration the unit works on, if any.
    pub integration_id: Option<IntegrationId>,
    /// Unit type, used to resolve policies.
    pub unit_type: UnitType,
    /// Inactive units are never scheduled.
    pub active: bool,
    /// Scheduling cadence in seconds. Zero or negative disables automatic scheduling.
    pub frequency_secs: i64,
    /// Optional separate cadence for full scans, in seconds.
    pub full_frequency_secs: Option<i64>,
    /// Retry parameters.
    pub retry: UnitRetry,
    /// Dispatch priority.
    pub priority: Priority,
    /// Most recent iteration scheduled for this unit.
    pub last_iteration: Option<Iteration>,
    /// Timestamp of the most recent full iteration.
    pub last_full_iteration_ts: Option<DateTime<Utc>>,
    /// Overrides the type-level backpressure threshold.
    pub backpressure_threshold: Option<usize>,
    /// Where to POST iteration results.
    pub callback_url: Option<String>,
    /// When the unit was created.
    pub created_at: DateTime<Utc>,
    /// When the unit was last updated.
    pub updated_at: DateTime<Utc>,
}

impl SchedulableUnit {
    /// Create an active unit that has never run.
    pub fn new(
        id: impl Into<UnitId>,
        tenant_id: impl Into<TenantId>,
        unit_type: impl Into<UnitType>,
        frequency_secs: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            integration_id: None,
            unit_type: unit_type.into(),
            active: true,
            frequency_secs,
            full_frequency_secs: None,
            retry: UnitRetry::default(),
            priority: Priority::default(),
            last_iteration: None,
            last_full_iteration_ts: None,
            backpressure_threshold: None,
            callback_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the integration.
    pub fn with_integration(mut self, integration_id: impl Into<IntegrationId>) -> Self {
        self.integration_id = Some(integration_id.into());
        self
    }

    /// Set the full-scan cadence.
    pub fn with_full_frequency(mut self, secs: i64) -> Self {
        self.full_frequency_secs = Some(secs);
        self
    }

    /// Set the retry parameters.
    pub fn with_retry(mut self, retry: UnitRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the backpressure threshold override.
    pub fn with_backpressure_threshold(mut self, threshold: usize) -> Self {
        self.backpressure_threshold = Some(threshold);
        self
    }

    /// Set the callback URL.
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Set the active flag.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Set the creation timestamp (and the update timestamp with it).
    pub fn with_created_at(mut self, ts: DateTime<Utc>) -> Self {
        self.created_at = ts;
        self.updated_at = ts;
        self
    }

    /// Pretend the unit was last scheduled by `iteration`.
    pub fn with_last_iteration(mut self, iteration: Iteration, full: bool) -> Self {
        if full {
            self.last_full_iteration_ts = Some(iteration.ts);
        }
        self.last_iteration = Some(iteration);
        self
    }

    /// Timestamp of the last scheduled iteration.
    pub fn last_iteration_ts(&self) -> Option<DateTime<Utc>> {
        self.last_iteration.as_ref().map(|it| it.ts)
    }

    /// Decide whether the unit is due at `now`, and for which kind of scan.
    ///
    /// A unit that never ran is due for a full scan. With a full cadence
    /// configured, that cadence is checked first and the regular cadence
    /// produces partial scans; without one every scan is full.
    pub fn due(&self, now: DateTime<Utc>) -> Option<DueKind> {
        if !self.active {
            return None;
        }
        let regular = positive_secs(self.frequency_secs);
        let full = self.full_frequency_secs.and_then(positive_secs);
        if regular.is_none() && full.is_none() {
            return None;
        }

        let Some(last) = &self.last_iteration else {
            return Some(DueKind::Full);
        };

        if let Some(full_every) = full {
            match self.last_full_iteration_ts {
                None => return Some(DueKind::Full),
                Some(ts) if age(ts, now) >= full_every => return Some(DueKind::Full),
                Some(_) => {}
            }
        }

        match regular {
            Some(every) if age(last.ts, now) >= every => Some(if full.is_some() {
                DueKind::Partial
            } else {
                DueKind::Full
            }),
            _ => None,
        }
    }
}

fn positive_secs(secs: i64) -> Option<chrono::Duration> {
    (secs > 0).then(|| seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IterationId;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn ran_at(unit: SchedulableUnit, secs: i64, full: bool) -> SchedulableUnit {
        unit.with_last_iteration(Iteration::new(IterationId::new(), at(secs)), full)
    }

    #[test]
    fn test_never_run_unit_is_due_full() {
        let unit = SchedulableUnit::new("u1", "t1", "jira", 60);
        assert_eq!(unit.due(at(0)), Some(DueKind::Full));
    }

    #[test]
    fn test_non_positive_frequency_disables_scheduling() {
        let zero = SchedulableUnit::new("u1", "t1", "jira", 0);
        let negative = SchedulableUnit::new("u2", "t1", "jira", -5);
        assert_eq!(zero.due(at(0)), None);
        assert_eq!(negative.due(at(0)), None);
    }

    #[test]
    fn test_inactive_unit_is_never_due() {
        let unit = SchedulableUnit::new("u1", "t1", "jira", 60).with_active(false);
        assert_eq!(unit.due(at(0)), None);
    }

    #[test]
    fn test_regular_cadence_boundary() {
        let unit = ran_at(SchedulableUnit::new("u1", "t1", "jira", 60), 0, true);
        assert_eq!(unit.due(at(59)), None);
        assert_eq!(unit.due(at(60)), Some(DueKind::Full));
    }

    #[test]
    fn test_full_cadence_is_checked_independently() {
        let unit = SchedulableUnit::new("u1", "t1", "jira", 60).with_full_frequency(3600);
        let unit = ran_at(unit, 0, true);

        // Regular cadence elapsed, full cadence not: partial scan.
        assert_eq!(unit.due(at(61)), Some(DueKind::Partial));

        // Regular iteration at 3000 keeps the last full at 0.
        let mut unit = unit;
        unit.last_iteration = Some(Iteration::new(IterationId::new(), at(3000)));
        assert_eq!(unit.due(at(3010)), None);
        assert_eq!(unit.due(at(3600)), Some(DueKind::Full));
    }

    #[test]
    fn test_full_only_cadence() {
        let unit = SchedulableUnit::new("u1", "t1", "jira", 0).with_full_frequency(100);
        let unit = ran_at(unit, 0, true);
        assert_eq!(unit.due(at(50)), None);
        assert_eq!(unit.due(at(100)), Some(DueKind::Full));
    }

    #[test]
    fn test_huge_frequencies_are_never_due_again() {
        let unit = SchedulableUnit::new("u1", "t1", "jira", i64::MAX).with_full_frequency(i64::MAX);
        assert_eq!(unit.due(at(0)), Some(DueKind::Full));

        let unit = ran_at(unit, 0, true);
        assert_eq!(unit.due(at(10_000_000)), None);
    }

    #[test]
    fn test_priority_numeric_roundtrip_defaults_to_medium() {
        assert_eq!(Priority::from_i64(Priority::High.as_i64()), Priority::High);
        assert_eq!(Priority::from_i64(42), Priority::Medium);
    }
}
