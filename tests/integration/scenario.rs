//! The backpressure and retry timeline of a single unit.
//!
//! Unit U has threshold 1, frequency 60s, three attempts and a 60 second
//! retry wait. Its first execution is claimed at t=65 and fails at t=70.

use crate::common::{AGENT, Harness, epoch, registry_with_attempts};
use cadence::core::{AgentId, ExecutionStatus, SchedulableUnit, UnitRetry};
use cadence::events::RetryReason;
use cadence::retry::RetryConfig;
use cadence::testing::UnitFixture;
use cadence::worker::WorkerReport;
use cadence::Event;
use serde_json::json;

fn unit() -> SchedulableUnit {
    UnitFixture::new("u1")
        .every(60)
        .threshold(1)
        .build()
        .with_retry(UnitRetry {
            max_attempts: Some(3),
            wait_secs: Some(60),
            timeout_secs: None,
        })
        .with_created_at(epoch())
}

#[tokio::test]
async fn test_backpressure_then_retry_timeline() {
    let h = Harness::with_registry(registry_with_attempts(3, 60)).await;
    h.storage.insert_unit(unit()).await.unwrap();
    let scheduling = h.scheduling();
    let retry = h.retry(RetryConfig::default());
    let gateway = h.gateway();
    let agent = AgentId::new(AGENT);

    // t=0: first execution.
    h.at(0);
    let stats = scheduling.tick().await;
    assert_eq!(stats.created, 1);
    let executions = h.executions("u1").await;
    assert_eq!(executions.len(), 1);
    let e1 = executions[0].clone();
    assert_eq!(e1.status, ExecutionStatus::Scheduled);
    assert_eq!(e1.attempt_count, 0);

    // t=30: nothing new.
    h.at(30);
    assert_eq!(scheduling.tick().await.created, 0);
    assert_eq!(h.executions("u1").await.len(), 1);

    // t=61: due again, held back by E1 still queued.
    h.at(61);
    let stats = scheduling.tick().await;
    assert_eq!(stats.schedulable, 1);
    assert_eq!(stats.backpressured, 1);
    assert_eq!(stats.created, 0);

    // t=65: claimed.
    h.at(65);
    let claimed = gateway.claim(&e1.id, &agent).await.unwrap().applied().unwrap();
    assert_eq!(claimed.status, ExecutionStatus::Accepted);
    assert_eq!(claimed.worker_id, Some(agent.clone()));

    // t=70: failed.
    h.at(70);
    let failed = gateway
        .report(
            &e1.id,
            &agent,
            WorkerReport::new(ExecutionStatus::Failure).with_error(json!({"message": "rate limited"})),
        )
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failure);
    assert_eq!(failed.attempt_count, 1);

    // t=125: 55s after the failure, too early. A retryable failure still holds the unit back.
    h.at(125);
    assert_eq!(retry.tick().await.retried, 0);
    let e = h.storage.get_execution(&e1.id).await.unwrap();
    assert_eq!(e.status, ExecutionStatus::Failure);
    let stats = scheduling.tick().await;
    assert_eq!(stats.backpressured, 1);
    assert_eq!(stats.created, 0);

    // t=131: 61s after the failure, back in the queue.
    h.at(131);
    assert_eq!(retry.tick().await.retried, 1);
    let e = h.storage.get_execution(&e1.id).await.unwrap();
    assert_eq!(e.status, ExecutionStatus::Scheduled);
    assert_eq!(e.worker_id, None);
    assert!(e.attempt_count > e1.attempt_count);
    assert_eq!(e.iteration_id, e1.iteration_id);
    assert_eq!(h.executions("u1").await.len(), 1);

    let retried = h.recorder.of_kind("retried").await;
    assert!(matches!(
        retried.as_slice(),
        [Event::ExecutionRetried {
            reason: RetryReason::Failed,
            attempt: 1,
            ..
        }]
    ));
}

#[tokio::test]
async fn test_attempts_are_monotonic_until_terminal() {
    let h = Harness::with_registry(registry_with_attempts(3, 60)).await;
    h.storage.insert_unit(unit()).await.unwrap();
    let retry = h.retry(RetryConfig::default());
    let gateway = h.gateway();
    let agent = AgentId::new(AGENT);

    h.at(0);
    h.scheduling().tick().await;
    let id = h.executions("u1").await[0].id.clone();

    let mut clock = 0;
    let mut seen = Vec::new();
    for _ in 0..3 {
        clock += 10;
        h.at(clock);
        let claimed = gateway.claim(&id, &agent).await.unwrap().applied().unwrap();
        seen.push(claimed.attempt_count);
        gateway
            .report(&id, &agent, WorkerReport::new(ExecutionStatus::Failure))
            .await
            .unwrap();
        clock += 61;
        h.at(clock);
        retry.tick().await;
    }

    assert_eq!(seen, vec![1, 2, 3]);
    // Out of attempts: the failure is final and no longer holds the unit back.
    let e = h.storage.get_execution(&id).await.unwrap();
    assert_eq!(e.status, ExecutionStatus::Failure);
    assert_eq!(e.attempt_count, 3);
    assert_eq!(h.recorder.of_kind("retried").await.len(), 2);

    h.at(clock + 600);
    assert_eq!(retry.tick().await.retried, 0);
    assert_eq!(h.scheduling().tick().await.created, 1);
}
