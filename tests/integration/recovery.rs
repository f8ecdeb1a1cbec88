//! Recovery of orphaned, stale and abandoned executions.

use crate::common::{AGENT, Harness, epoch};
use cadence::core::{AgentId, Clock, ExecutionInstance, ExecutionStatus};
use cadence::events::RetryReason;
use cadence::monitor::MonitorConfig;
use cadence::retry::RetryConfig;
use cadence::storage::{UnitCondition, UnitUpdate};
use cadence::testing::{UnitFixture, execution};
use cadence::Event;
use chrono::Duration;

fn short_timeouts() -> RetryConfig {
    RetryConfig {
        job_timeout: Some(Duration::minutes(10)),
        heartbeat_timeout: Some(Duration::minutes(5)),
        ..RetryConfig::default()
    }
}

fn claimed_by(worker: &str, attempts: u32) -> ExecutionInstance {
    let unit = UnitFixture::new("u1").build();
    execution(&unit, ExecutionStatus::Accepted, false, epoch())
        .with_worker(worker)
        .with_attempts(attempts)
        .with_heartbeat(epoch())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orphan_detection_is_idempotent() {
    let h = Harness::new().await;
    let orphan = claimed_by("agent-gone", 1);
    h.storage.insert_execution(orphan.clone()).await.unwrap();
    let a = h.retry(short_timeouts());
    let b = h.retry(short_timeouts());
    h.at(11 * 60);

    let (sa, sb) = tokio::join!(a.tick(), b.tick());
    assert_eq!(sa.reset + sb.reset, 1);
    assert_eq!(a.tick().await.reset, 0);

    let stored = h.storage.get_execution(&orphan.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Scheduled);
    assert_eq!(stored.worker_id, None);
    assert_eq!(stored.attempt_count, 1);
    let retried = h.recorder.of_kind("retried").await;
    assert!(matches!(
        retried.as_slice(),
        [Event::ExecutionRetried {
            reason: RetryReason::Orphaned,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_live_worker_with_recent_heartbeat_is_left_alone() {
    let h = Harness::new().await;
    let working = claimed_by(AGENT, 1);
    h.storage.insert_execution(working.clone()).await.unwrap();
    let gateway = h.gateway();
    let retry = h.retry(short_timeouts());

    h.at(9 * 60);
    assert!(gateway.heartbeat(&working.id, &AgentId::new(AGENT)).await.unwrap().is_applied());
    h.at(11 * 60);
    assert_eq!(retry.tick().await.reset, 0);

    // Silent for longer than the heartbeat timeout.
    h.at(15 * 60);
    assert_eq!(retry.tick().await.reset, 1);
    let stored = h.storage.get_execution(&working.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Scheduled);
}

#[tokio::test]
async fn test_assigned_job_timeout_resets_busy_workers_only_when_enabled() {
    let h = Harness::new().await;
    let busy = claimed_by(AGENT, 1);
    h.storage.insert_execution(busy.clone()).await.unwrap();
    let gateway = h.gateway();
    h.at(30 * 60);
    gateway.heartbeat(&busy.id, &AgentId::new(AGENT)).await.unwrap();

    assert_eq!(h.retry(short_timeouts()).tick().await.reset, 0);

    let stale = h.retry(RetryConfig {
        assigned_job_timeout: Some(Duration::minutes(20)),
        ..short_timeouts()
    });
    assert_eq!(stale.tick().await.reset, 1);
    assert!(matches!(
        h.recorder.of_kind("retried").await.as_slice(),
        [Event::ExecutionRetried {
            reason: RetryReason::Stale,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_timed_out_execution_without_attempts_fails_for_good() {
    let h = Harness::new().await;
    let last = claimed_by("agent-gone", 3).with_max_attempts(3);
    h.storage.insert_execution(last.clone()).await.unwrap();
    h.at(11 * 60);

    let stats = h.retry(short_timeouts()).tick().await;

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.reset, 0);
    let stored = h.storage.get_execution(&last.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failure);
    assert!(stored.error.is_some());
    assert_eq!(h.recorder.of_kind("exhausted").await.len(), 1);

    // Terminal: no further retries.
    h.at(60 * 60);
    assert!(h.retry(short_timeouts()).tick().await.is_empty());
}

#[tokio::test]
async fn test_late_report_from_reclaimed_worker_is_rejected() {
    let h = Harness::new().await;
    let orphan = claimed_by("agent-slow", 1);
    h.storage.insert_execution(orphan.clone()).await.unwrap();
    h.at(11 * 60);
    h.retry(short_timeouts()).tick().await;
    let gateway = h.gateway();
    let winner = gateway.claim(&orphan.id, &AgentId::new(AGENT)).await.unwrap();
    assert!(winner.is_applied());

    let late = gateway
        .report(
            &orphan.id,
            &AgentId::new("agent-slow"),
            cadence::worker::WorkerReport::new(ExecutionStatus::Success),
        )
        .await
        .unwrap();

    assert!(!late.is_applied());
    let stored = h.storage.get_execution(&orphan.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Accepted);
    assert_eq!(stored.worker_id, Some(AgentId::new(AGENT)));
    assert_eq!(stored.attempt_count, 2);
}

#[tokio::test]
async fn test_disabling_a_unit_cancels_its_queue() {
    let h = Harness::new().await;
    let unit = UnitFixture::new("u1").build();
    h.storage.insert_unit(unit.clone()).await.unwrap();
    h.at(0);
    h.scheduling().tick().await;
    let queued = h.executions("u1").await.remove(0);
    let running = execution(&unit, ExecutionStatus::Pending, true, epoch()).with_worker(AGENT);
    h.storage.insert_execution(running.clone()).await.unwrap();

    h.at(60);
    h.storage
        .update_unit(
            &unit.id,
            &UnitUpdate::set_active(h.clock.now(), false),
            &UnitCondition::default(),
        )
        .await
        .unwrap();
    let stats = h.monitor(MonitorConfig::default()).tick().await;

    assert_eq!(stats.canceled, 1);
    assert_eq!(stats.flagged, 1);
    assert_eq!(
        h.storage.get_execution(&queued.id).await.unwrap().status,
        ExecutionStatus::Canceled
    );
    assert_eq!(
        h.storage.get_execution(&running.id).await.unwrap().status,
        ExecutionStatus::Pending
    );
    assert_eq!(h.scheduling().tick().await.created, 0);
}

#[tokio::test]
async fn test_queue_stuck_executions_are_flagged() {
    let h = Harness::new().await;
    let unit = UnitFixture::new("u1").build();
    h.storage.insert_unit(unit.clone()).await.unwrap();
    h.storage
        .insert_execution(execution(&unit, ExecutionStatus::Scheduled, false, epoch()))
        .await
        .unwrap();
    let monitor = h.monitor(MonitorConfig {
        queued_stuck_threshold: Some(Duration::minutes(30)),
        ..MonitorConfig::default()
    });

    h.at(20 * 60);
    assert_eq!(monitor.tick().await.stuck, 0);
    h.at(31 * 60);
    assert_eq!(monitor.tick().await.stuck, 1);
    assert_eq!(h.recorder.of_kind("stuck").await.len(), 1);
}
