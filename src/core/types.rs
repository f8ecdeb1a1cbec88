//! Core identifier types for the orchestrator.
//!
//! These types provide type-safe identifiers for units, executions,
//! iterations, tenants, integrations, agents and retry classes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a string-backed identifier with the usual conversions.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the underlying string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id! {
    /// Unique identifier for a schedulable unit (trigger or job definition).
    UnitId
}

string_id! {
    /// Tenant that owns a unit.
    TenantId
}

string_id! {
    /// Integration a unit ingests from or aggregates over.
    IntegrationId
}

string_id! {
    /// Type of a unit, e.g. `jira` or `github_aggregation`.
    ///
    /// Retry classes, backpressure thresholds and result mergers are keyed by it.
    UnitType
}

string_id! {
    /// Identifier of a worker agent that claims executions.
    AgentId
}

string_id! {
    /// Name of a retry class.
    RetryClassName
}

/// Unique identifier for an execution instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

/// Unique identifier for one scheduling iteration of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IterationId(Uuid);

impl ExecutionId {
    /// Generate a new random ExecutionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an ExecutionId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl IterationId {
    /// Generate a new random IterationId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an IterationId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for IterationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IterationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_creation() {
        let unit_id = UnitId::new("jira-ingest");
        assert_eq!(unit_id.as_str(), "jira-ingest");
        assert_eq!(format!("{}", unit_id), "jira-ingest");
    }

    #[test]
    fn test_string_ids_from_str() {
        let id1: AgentId = "agent-1".into();
        let id2 = AgentId::new("agent-1");
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_execution_id_is_unique() {
        assert_ne!(ExecutionId::new(), ExecutionId::new());
    }

    #[test]
    fn test_execution_id_orders_like_its_string_form() {
        let mut ids: Vec<ExecutionId> = (0..16).map(|_| ExecutionId::new()).collect();
        let mut strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        ids.sort();
        strings.sort();
        let sorted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(sorted, strings);
    }

    #[test]
    fn test_iteration_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let iteration_id = IterationId::from_uuid(uuid);
        assert_eq!(iteration_id.as_uuid(), &uuid);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&UnitType::new("jira")).unwrap();
        assert_eq!(json, "\"jira\"");
    }
}
