//! The same flows against the sqlite backend.

use crate::common::{AGENT, Harness, registry_with_attempts};
use cadence::core::{AgentId, ExecutionStatus, UnitRetry};
use cadence::lock::{LockService, names};
use cadence::retry::RetryConfig;
use cadence::storage::SqliteStorage;
use cadence::testing::UnitFixture;
use cadence::worker::WorkerReport;
use chrono::Duration;
use std::sync::Arc;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(dir.path().join("cadence.db")).await.unwrap())
}

#[tokio::test]
async fn test_schedule_claim_fail_retry_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let h = Harness::with_storage(open(&dir).await, registry_with_attempts(3, 60)).await;
    h.storage
        .insert_unit(UnitFixture::new("u1").every(60).build().with_retry(UnitRetry {
            max_attempts: Some(3),
            wait_secs: Some(60),
            timeout_secs: None,
        }))
        .await
        .unwrap();
    let gateway = h.gateway();
    let agent = AgentId::new(AGENT);

    h.at(0);
    assert_eq!(h.scheduling().tick().await.created, 1);
    h.at(61);
    assert_eq!(h.scheduling().tick().await.backpressured, 1);

    h.at(65);
    let claimed = gateway.claim_next(&agent).await.unwrap().unwrap();
    assert!(gateway.claim(&claimed.id, &AgentId::new("other")).await.unwrap().applied().is_none());
    h.at(70);
    gateway
        .report(&claimed.id, &agent, WorkerReport::new(ExecutionStatus::Failure))
        .await
        .unwrap();

    let retry = h.retry(RetryConfig::default());
    h.at(125);
    assert_eq!(retry.tick().await.retried, 0);
    h.at(131);
    assert_eq!(retry.tick().await.retried, 1);

    let stored = h.storage.get_execution(&claimed.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Scheduled);
    assert_eq!(stored.worker_id, None);
    assert_eq!(stored.attempt_count, 1);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let h = Harness::with_storage(open(&dir).await, Default::default()).await;
        h.storage.insert_unit(UnitFixture::new("u1").build()).await.unwrap();
        h.at(0);
        h.scheduling().tick().await;
    }

    let h = Harness::with_storage(open(&dir).await, Default::default()).await;
    let executions = h.executions("u1").await;
    assert_eq!(executions.len(), 1);
    let unit = h.storage.get_unit(&executions[0].unit_id).await.unwrap();
    assert_eq!(unit.last_iteration_ts(), Some(executions[0].iteration_ts));
}

#[tokio::test]
async fn test_sqlite_lease_excludes_other_holders() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir).await;
    let ttl = Duration::seconds(30);

    let lease = storage
        .try_acquire(names::RETRY, "replica-a", ttl)
        .await
        .unwrap()
        .unwrap();
    assert!(storage.try_acquire(names::RETRY, "replica-b", ttl).await.unwrap().is_none());
    assert!(storage.try_acquire(names::MONITOR, "replica-b", ttl).await.unwrap().is_some());

    assert!(storage.release(&lease).await.unwrap());
    assert!(storage.try_acquire(names::RETRY, "replica-b", ttl).await.unwrap().is_some());
}
