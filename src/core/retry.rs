//! Retry classes and backoff.
//!
//! Every execution is bound to a retry class when it is created. A class owns
//! an attempt ceiling and a backoff that maps the attempt count to the wait
//! between a failure and the next attempt.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::clock::seconds;
use super::types::{RetryClassName, UnitType};

/// Name of the class used when a unit type has no binding.
pub const DEFAULT_CLASS: &str = "default";

/// Attempt ceiling of the default class.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Step of the default linear backoff, in seconds.
pub const DEFAULT_STEP_SECS: i64 = 60;

/// Wait function of a retry class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `(attempt + 1) * step`.
    Linear { step_secs: i64 },
    /// The same wait after every attempt.
    Constant { wait_secs: i64 },
}

impl Backoff {
    /// Wait required after `attempt` attempts before retrying.
    pub fn wait(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Linear { step_secs } => {
                seconds(step_secs.saturating_mul(i64::from(attempt) + 1))
            }
            Backoff::Constant { wait_secs } => seconds(wait_secs),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear {
            step_secs: DEFAULT_STEP_SECS,
        }
    }
}

/// A named retry class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Class name, stored on each execution.
    pub class: RetryClassName,

    /// Total number of attempts allowed, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl RetryPolicy {
    /// Create a class with the given ceiling and backoff.
    pub fn new(class: impl Into<RetryClassName>, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            class: class.into(),
            max_attempts,
            backoff,
        }
    }

    /// Linear backoff class.
    pub fn linear(class: impl Into<RetryClassName>, max_attempts: u32, step_secs: i64) -> Self {
        Self::new(class, max_attempts, Backoff::Linear { step_secs })
    }

    /// Constant backoff class.
    pub fn constant(class: impl Into<RetryClassName>, max_attempts: u32, wait_secs: i64) -> Self {
        Self::new(class, max_attempts, Backoff::Constant { wait_secs })
    }

    /// Wait after `attempt` attempts. A per-execution constant wait wins.
    pub fn wait(&self, attempt: u32, override_secs: Option<i64>) -> Duration {
        match override_secs {
            Some(secs) => seconds(secs),
            None => self.backoff.wait(attempt),
        }
    }
}

impl Default for RetryPolicy {
    /// `default` class: three attempts, linear 60 second step.
    fn default() -> Self {
        Self::new(DEFAULT_CLASS, DEFAULT_MAX_ATTEMPTS, Backoff::default())
    }
}

/// Retry classes plus the unit-type binding table.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicyTable {
    default: RetryPolicy,
    classes: HashMap<RetryClassName, RetryPolicy>,
    bindings: HashMap<UnitType, RetryClassName>,
}

impl RetryPolicyTable {
    /// Table holding only `default`.
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            classes: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// Add a class. A class named like the default replaces it.
    pub fn with_class(mut self, policy: RetryPolicy) -> Self {
        if policy.class == self.default.class {
            self.default = policy;
        } else {
            self.classes.insert(policy.class.clone(), policy);
        }
        self
    }

    /// Bind a unit type to a class.
    pub fn bind(mut self, unit_type: impl Into<UnitType>, class: impl Into<RetryClassName>) -> Self {
        self.bindings.insert(unit_type.into(), class.into());
        self
    }

    /// Class used for units of `unit_type`.
    ///
    /// Unbound types, and bindings to unknown classes, resolve to the default.
    pub fn resolve(&self, unit_type: &UnitType) -> &RetryPolicy {
        self.bindings
            .get(unit_type)
            .and_then(|class| self.get(class))
            .unwrap_or(&self.default)
    }

    /// Look up a class by name.
    pub fn get(&self, class: &RetryClassName) -> Option<&RetryPolicy> {
        if *class == self.default.class {
            Some(&self.default)
        } else {
            self.classes.get(class)
        }
    }

    /// The default class.
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }

    /// Every class, default first.
    pub fn policies(&self) -> impl Iterator<Item = &RetryPolicy> {
        std::iter::once(&self.default).chain(self.classes.values())
    }
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
