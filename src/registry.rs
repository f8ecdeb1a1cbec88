//! Agent liveness, result merging and per-type unit policies.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::core::{AgentId, RetryClassName, RetryPolicy, RetryPolicyTable, SchedulableUnit, UnitType};

/// Answers whether a worker agent is still alive.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn is_agent_live(&self, agent_id: &AgentId) -> bool;
}

/// Agent registry backed by an explicit set of live agents.
#[derive(Debug, Default)]
pub struct StaticAgentRegistry {
    live: RwLock<HashSet<AgentId>>,
}

impl StaticAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry where `agents` are live.
    pub fn with_live<I, A>(agents: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        Self {
            live: RwLock::new(agents.into_iter().map(Into::into).collect()),
        }
    }

    pub fn mark_live(&self, agent_id: impl Into<AgentId>) {
        if let Ok(mut live) = self.live.write() {
            live.insert(agent_id.into());
        }
    }

    pub fn mark_dead(&self, agent_id: &AgentId) {
        if let Ok(mut live) = self.live.write() {
            live.remove(agent_id);
        }
    }
}

#[async_trait]
impl AgentRegistry for StaticAgentRegistry {
    async fn is_agent_live(&self, agent_id: &AgentId) -> bool {
        // A poisoned set reports every agent live, so nothing gets reclaimed
        // on a broken registry.
        self.live
            .read()
            .map(|live| live.contains(agent_id))
            .unwrap_or(true)
    }
}

/// Registry that reports every agent live.
///
/// With it, orphan detection relies on heartbeats alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeLive;

#[async_trait]
impl AgentRegistry for AssumeLive {
    async fn is_agent_live(&self, _agent_id: &AgentId) -> bool {
        true
    }
}

/// Combines a stored payload with an incoming report.
///
/// Implementations must be idempotent: merging the same report twice
/// yields the same payload as merging it once.
pub trait ResultMerger: Send + Sync {
    fn merge(&self, current: Option<&Value>, incoming: &Value) -> Value;
}

/// Recursive JSON object merge. On anything but two objects the incoming value wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMerge;

impl JsonMerge {
    fn merge_values(current: &Value, incoming: &Value) -> Value {
        match (current, incoming) {
            (Value::Object(base), Value::Object(update)) => {
                let mut merged = base.clone();
                for (key, value) in update {
                    let next = match merged.get(key) {
                        Some(existing) => Self::merge_values(existing, value),
                        None => value.clone(),
                    };
                    merged.insert(key.clone(), next);
                }
                Value::Object(merged)
            }
            (_, incoming) => incoming.clone(),
        }
    }
}

impl ResultMerger for JsonMerge {
    fn merge(&self, current: Option<&Value>, incoming: &Value) -> Value {
        match current {
            Some(current) => Self::merge_values(current, incoming),
            None => incoming.clone(),
        }
    }
}

/// Policy resolved for one unit at execution creation.
#[derive(Clone)]
pub struct UnitPolicy {
    pub retry_class: RetryClassName,
    pub max_attempts: u32,
    pub retry_wait_secs: Option<i64>,
    pub timeout_secs: Option<i64>,
    /// Backpressure threshold, at least 1.
    pub threshold: usize,
    pub merger: Arc<dyn ResultMerger>,
}

impl std::fmt::Debug for UnitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitPolicy")
            .field("retry_class", &self.retry_class)
            .field("max_attempts", &self.max_attempts)
            .field("retry_wait_secs", &self.retry_wait_secs)
            .field("timeout_secs", &self.timeout_secs)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

/// Per-unit-type policy table.
pub struct UnitTypeRegistry {
    retry: RetryPolicyTable,
    default_threshold: usize,
    thresholds: HashMap<UnitType, usize>,
    mergers: HashMap<UnitType, Arc<dyn ResultMerger>>,
    default_merger: Arc<dyn ResultMerger>,
}

impl UnitTypeRegistry {
    pub fn new(retry: RetryPolicyTable) -> Self {
        Self {
            retry,
            default_threshold: 1,
            thresholds: HashMap::new(),
            mergers: HashMap::new(),
            default_merger: Arc::new(JsonMerge),
        }
    }

    pub fn with_default_threshold(mut self, threshold: usize) -> Self {
        self.default_threshold = threshold;
        self
    }

    pub fn with_threshold(mut self, unit_type: impl Into<UnitType>, threshold: usize) -> Self {
        self.thresholds.insert(unit_type.into(), threshold);
        self
    }

    pub fn with_merger(
        mut self,
        unit_type: impl Into<UnitType>,
        merger: Arc<dyn ResultMerger>,
    ) -> Self {
        self.mergers.insert(unit_type.into(), merger);
        self
    }

    pub fn retry_table(&self) -> &RetryPolicyTable {
        &self.retry
    }

    /// Retry class bound to `unit_type`.
    pub fn retry_policy(&self, unit_type: &UnitType) -> &RetryPolicy {
        self.retry.resolve(unit_type)
    }

    /// Backpressure threshold: unit override, then type, then default. Zero counts as one.
    pub fn threshold(&self, unit: &SchedulableUnit) -> usize {
        unit.backpressure_threshold
            .or_else(|| self.thresholds.get(&unit.unit_type).copied())
            .unwrap_or(self.default_threshold)
            .max(1)
    }

    pub fn merger(&self, unit_type: &UnitType) -> Arc<dyn ResultMerger> {
        self.mergers
            .get(unit_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_merger))
    }

    /// Everything an execution of `unit` needs to carry.
    pub fn resolve(&self, unit: &SchedulableUnit) -> UnitPolicy {
        let class = self.retry.resolve(&unit.unit_type);
        UnitPolicy {
            retry_class: class.class.clone(),
            max_attempts: unit.retry.max_attempts.unwrap_or(class.max_attempts),
            retry_wait_secs: unit.retry.wait_secs,
            timeout_secs: unit.retry.timeout_secs,
            threshold: self.threshold(unit),
            merger: self.merger(&unit.unit_type),
        }
    }
}

impl Default for UnitTypeRegistry {
    fn default() -> Self {
        Self::new(RetryPolicyTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UnitRetry;
    use serde_json::json;

    #[test]
    fn test_json_merge_is_recursive_and_incoming_wins() {
        let current = json!({"counts": {"issues": 3, "prs": 1}, "cursor": "a"});
        let incoming = json!({"counts": {"issues": 5}, "cursor": "b", "done": true});

        let merged = JsonMerge.merge(Some(&current), &incoming);

        assert_eq!(
            merged,
            json!({"counts": {"issues": 5, "prs": 1}, "cursor": "b", "done": true})
        );
    }

    #[test]
    fn test_json_merge_is_idempotent() {
        let current = json!({"a": {"b": 1}});
        let incoming = json!({"a": {"c": 2}, "d": [1, 2]});

        let once = JsonMerge.merge(Some(&current), &incoming);
        let twice = JsonMerge.merge(Some(&once), &incoming);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_json_merge_without_current() {
        assert_eq!(JsonMerge.merge(None, &json!(7)), json!(7));
    }

    #[test]
    fn test_threshold_resolution_order() {
        let registry = UnitTypeRegistry::default()
            .with_default_threshold(2)
            .with_threshold("github", 5);

        let plain = SchedulableUnit::new("u1", "t1", "jira", 60);
        let typed = SchedulableUnit::new("u2", "t1", "github", 60);
        let overridden = typed.clone().with_backpressure_threshold(9);
        let zero = plain.clone().with_backpressure_threshold(0);

        assert_eq!(registry.threshold(&plain), 2);
        assert_eq!(registry.threshold(&typed), 5);
        assert_eq!(registry.threshold(&overridden), 9);
        assert_eq!(registry.threshold(&zero), 1);
    }

    #[test]
    fn test_resolve_prefers_unit_retry_overrides() {
        let registry = UnitTypeRegistry::new(
            RetryPolicyTable::default()
                .with_class(RetryPolicy::constant("slow", 5, 600))
                .bind("github", "slow"),
        );
        let unit = SchedulableUnit::new("u1", "t1", "github", 60).with_retry(UnitRetry {
            max_attempts: Some(2),
            wait_secs: Some(30),
            timeout_secs: None,
        });

        let policy = registry.resolve(&unit);

        assert_eq!(policy.retry_class.as_str(), "slow");
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.retry_wait_secs, Some(30));
        assert_eq!(policy.threshold, 1);
    }

    #[tokio::test]
    async fn test_static_agent_registry() {
        let registry = StaticAgentRegistry::with_live(["a1"]);
        assert!(registry.is_agent_live(&AgentId::new("a1")).await);
        assert!(!registry.is_agent_live(&AgentId::new("a2")).await);

        registry.mark_dead(&AgentId::new("a1"));
        registry.mark_live("a2");
        assert!(!registry.is_agent_live(&AgentId::new("a1")).await);
        assert!(registry.is_agent_live(&AgentId::new("a2")).await);
    }
}
