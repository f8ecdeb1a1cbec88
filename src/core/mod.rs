//! Core domain types: identifiers, units, executions, iterations and retry classes.

pub mod clock;
pub mod execution;
pub mod iteration;
pub mod retry;
pub mod types;
pub mod unit;

pub use clock::{Clock, SystemClock};
pub use execution::{ExecutionInstance, ExecutionStatus};
pub use iteration::Iteration;
pub use retry::{Backoff, RetryPolicy, RetryPolicyTable};
pub use types::*;
pub use unit::{DueKind, Priority, SchedulableUnit, UnitRetry};
