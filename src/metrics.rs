//! Orchestration metrics.
//!
//! Recorded through the `metrics` facade. The binary does not install an
//! exporter; embedders pick their own recorder.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `cadence_executions_scheduled_total` | Counter | tenant, integration, unit_type, kind |
//! | `cadence_units_backpressured_total` | Counter | tenant, integration, unit_type |
//! | `cadence_executions_retried_total` | Counter | tenant, integration, unit_type, reason |
//! | `cadence_executions_timed_out_total` | Counter | tenant, integration, unit_type |
//! | `cadence_executions_stuck_total` | Counter | tenant, integration, unit_type, status |
//! | `cadence_executions_canceled_total` | Counter | tenant, integration, unit_type |
//! | `cadence_executions_deleted_total` | Counter | - |
//! | `cadence_sweep_failures_total` | Counter | sweep |
//! | `cadence_callbacks_total` | Counter | result |
//! | `cadence_sweep_units_scanned` | Gauge | sweep |

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::core::{ExecutionInstance, SchedulableUnit};

/// Metric names as constants for consistency.
pub mod names {
    pub const EXECUTIONS_SCHEDULED: &str = "cadence_executions_scheduled_total";
    pub const UNITS_BACKPRESSURED: &str = "cadence_units_backpressured_total";
    pub const EXECUTIONS_RETRIED: &str = "cadence_executions_retried_total";
    pub const EXECUTIONS_TIMED_OUT: &str = "cadence_executions_timed_out_total";
    pub const EXECUTIONS_STUCK: &str = "cadence_executions_stuck_total";
    pub const EXECUTIONS_CANCELED: &str = "cadence_executions_canceled_total";
    pub const EXECUTIONS_DELETED: &str = "cadence_executions_deleted_total";
    pub const SWEEP_FAILURES: &str = "cadence_sweep_failures_total";
    pub const CALLBACKS: &str = "cadence_callbacks_total";
    pub const SWEEP_UNITS_SCANNED: &str = "cadence_sweep_units_scanned";
}

/// Label keys used across metrics.
pub mod labels {
    pub const TENANT: &str = "tenant";
    pub const INTEGRATION: &str = "integration";
    pub const UNIT_TYPE: &str = "unit_type";
    pub const KIND: &str = "kind";
    pub const REASON: &str = "reason";
    pub const STATUS: &str = "status";
    pub const SWEEP: &str = "sweep";
    pub const RESULT: &str = "result";
}

/// Registers metric descriptions. Call once after installing a recorder.
pub fn register_metrics() {
    describe_counter!(names::EXECUTIONS_SCHEDULED, "Executions created by the scheduling loop");
    describe_counter!(names::UNITS_BACKPRESSURED, "Due units skipped because of backpressure");
    describe_counter!(names::EXECUTIONS_RETRIED, "Executions moved back to SCHEDULED");
    describe_counter!(names::EXECUTIONS_TIMED_OUT, "Timed-out executions failed for good");
    describe_counter!(names::EXECUTIONS_STUCK, "Executions flagged as stuck");
    describe_counter!(names::EXECUTIONS_CANCELED, "Queued executions of disabled units canceled");
    describe_counter!(names::EXECUTIONS_DELETED, "Terminal executions removed by retention");
    describe_counter!(names::SWEEP_FAILURES, "Per-row failures inside a sweep");
    describe_counter!(names::CALLBACKS, "Result callbacks by outcome");
    describe_gauge!(names::SWEEP_UNITS_SCANNED, "Rows scanned by the last sweep tick");
}

fn unit_labels(unit: &SchedulableUnit) -> Vec<(&'static str, String)> {
    vec![
        (labels::TENANT, unit.tenant_id.to_string()),
        (
            labels::INTEGRATION,
            unit.integration_id
                .as_ref()
                .map(|i| i.to_string())
                .unwrap_or_default(),
        ),
        (labels::UNIT_TYPE, unit.unit_type.to_string()),
    ]
}

fn execution_labels(execution: &ExecutionInstance) -> Vec<(&'static str, String)> {
    vec![
        (labels::TENANT, execution.tenant_id.to_string()),
        (
            labels::INTEGRATION,
            execution
                .integration_id
                .as_ref()
                .map(|i| i.to_string())
                .unwrap_or_default(),
        ),
        (labels::UNIT_TYPE, execution.unit_type.to_string()),
    ]
}

pub fn record_scheduled(unit: &SchedulableUnit, partial: bool) {
    let mut tags = unit_labels(unit);
    tags.push((labels::KIND, if partial { "partial" } else { "full" }.to_string()));
    counter!(names::EXECUTIONS_SCHEDULED, &tags).increment(1);
}

pub fn record_backpressured(unit: &SchedulableUnit) {
    counter!(names::UNITS_BACKPRESSURED, &unit_labels(unit)).increment(1);
}

pub fn record_retried(execution: &ExecutionInstance, reason: &str) {
    let mut tags = execution_labels(execution);
    tags.push((labels::REASON, reason.to_string()));
    counter!(names::EXECUTIONS_RETRIED, &tags).increment(1);
}

pub fn record_timed_out(execution: &ExecutionInstance) {
    counter!(names::EXECUTIONS_TIMED_OUT, &execution_labels(execution)).increment(1);
}

pub fn record_stuck(execution: &ExecutionInstance) {
    let mut tags = execution_labels(execution);
    tags.push((labels::STATUS, execution.status.as_str().to_string()));
    counter!(names::EXECUTIONS_STUCK, &tags).increment(1);
}

pub fn record_canceled(execution: &ExecutionInstance) {
    counter!(names::EXECUTIONS_CANCELED, &execution_labels(execution)).increment(1);
}

pub fn record_deleted(count: u64) {
    counter!(names::EXECUTIONS_DELETED).increment(count);
}

pub fn record_sweep_failure(sweep: &'static str) {
    counter!(names::SWEEP_FAILURES, labels::SWEEP => sweep).increment(1);
}

pub fn record_callback(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!(names::CALLBACKS, labels::RESULT => result).increment(1);
}

pub fn set_scanned(sweep: &'static str, scanned: usize) {
    gauge!(names::SWEEP_UNITS_SCANNED, labels::SWEEP => sweep).set(scanned as f64);
}
