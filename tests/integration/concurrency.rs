//! Claims and scheduling under concurrency.

use crate::common::{Harness, epoch};
use cadence::core::{AgentId, ExecutionStatus};
use cadence::testing::{UnitFixture, execution};
use cadence::worker::{GatewayOutcome, Rejection, WorkerReport};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_claim_under_concurrency() {
    let h = Harness::new().await;
    let unit = UnitFixture::new("u1").build();
    let queued = execution(&unit, ExecutionStatus::Scheduled, false, epoch());
    h.storage.insert_execution(queued.clone()).await.unwrap();
    let gateway = Arc::new(h.gateway());

    let mut claims = JoinSet::new();
    for i in 0..16 {
        let gateway = gateway.clone();
        let id = queued.id.clone();
        claims.spawn(async move {
            gateway
                .claim(&id, &AgentId::new(format!("agent-{}", i)))
                .await
                .unwrap()
        });
    }
    let outcomes = claims.join_all().await;

    let winners: Vec<_> = outcomes.iter().filter(|o| o.is_applied()).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        outcomes
            .iter()
            .filter(|o| !o.is_applied())
            .all(|o| matches!(
                o,
                GatewayOutcome::Rejected(Rejection::WrongState(ExecutionStatus::Accepted))
            ))
    );
    let stored = h.storage.get_execution(&queued.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Accepted);
    assert_eq!(stored.attempt_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claim_next_hands_out_each_execution_once() {
    let h = Harness::new().await;
    for i in 0..5 {
        let unit = UnitFixture::new(&format!("u{}", i)).build();
        h.storage
            .insert_execution(execution(&unit, ExecutionStatus::Scheduled, false, epoch()))
            .await
            .unwrap();
    }
    let gateway = Arc::new(h.gateway());

    let mut workers = JoinSet::new();
    for i in 0..12 {
        let gateway = gateway.clone();
        workers.spawn(async move {
            gateway
                .claim_next(&AgentId::new(format!("agent-{}", i)))
                .await
                .unwrap()
        });
    }
    let claimed: Vec<_> = workers.join_all().await.into_iter().flatten().collect();

    let ids: HashSet<_> = claimed.iter().map(|e| e.id.clone()).collect();
    assert_eq!(claimed.len(), 5);
    assert_eq!(ids.len(), 5);
    assert!(gateway.claim_next(&AgentId::new("late")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_scheduling_loops_create_one_execution_per_unit() {
    let h = Harness::new().await;
    for i in 0..10 {
        h.storage
            .insert_unit(UnitFixture::new(&format!("u{:02}", i)).build())
            .await
            .unwrap();
    }
    let a = h.scheduling();
    let b = h.scheduling();

    let (sa, sb) = tokio::join!(a.tick(), b.tick());

    assert_eq!(sa.created + sb.created, 10);
    for i in 0..10 {
        assert_eq!(h.executions(&format!("u{:02}", i)).await.len(), 1);
    }
}

#[tokio::test]
async fn test_at_most_threshold_executions_in_flight() {
    let h = Harness::new().await;
    h.storage
        .insert_unit(UnitFixture::new("u1").every(60).threshold(2).build())
        .await
        .unwrap();
    let scheduling = h.scheduling();

    for tick in 0..6 {
        h.at(tick * 61);
        scheduling.tick().await;
        assert!(h.count("u1", &ExecutionStatus::IN_FLIGHT).await <= 2);
    }

    assert_eq!(h.count("u1", &ExecutionStatus::IN_FLIGHT).await, 2);
    assert_eq!(h.recorder.of_kind("backpressured").await.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_reports_keep_every_intermediate_key() {
    let h = Harness::new().await;
    let gateway = Arc::new(h.gateway());
    let agent = AgentId::new("agent-a");

    for round in 0..20 {
        let unit = UnitFixture::new(&format!("u{}", round)).build();
        let queued = execution(&unit, ExecutionStatus::Scheduled, false, epoch());
        h.storage.insert_execution(queued.clone()).await.unwrap();
        assert!(gateway.claim(&queued.id, &agent).await.unwrap().is_applied());

        let mut reports = JoinSet::new();
        for key in ["a", "b", "c", "d"] {
            let gateway = gateway.clone();
            let agent = agent.clone();
            let id = queued.id.clone();
            reports.spawn(async move {
                let mut report = WorkerReport::new(ExecutionStatus::Pending);
                report.intermediate_state = Some(json!({ key: true }));
                gateway.report(&id, &agent, report).await.unwrap()
            });
        }
        assert!(reports.join_all().await.iter().all(|o| o.is_applied()));

        let stored = h.storage.get_execution(&queued.id).await.unwrap();
        assert_eq!(
            stored.intermediate_state,
            Some(json!({ "a": true, "b": true, "c": true, "d": true }))
        );
    }
}
