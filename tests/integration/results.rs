//! Result views and success callbacks.

use crate::common::{AGENT, Harness};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use cadence::core::{AgentId, ExecutionStatus, UnitId};
use cadence::results::{CallbackEnvelope, HttpCallback, ResultAggregator, ResultNotifier};
use cadence::testing::UnitFixture;
use cadence::worker::{WorkerGateway, WorkerReport};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Schedule at `secs`, then have the agent finish the new execution with `status`.
async fn run_iteration(h: &Harness, gateway: &WorkerGateway, secs: i64, status: ExecutionStatus) {
    h.at(secs);
    assert_eq!(h.scheduling().tick().await.created, 1, "nothing scheduled at t={}", secs);
    let agent = AgentId::new(AGENT);
    let claimed = gateway.claim_next(&agent).await.unwrap().unwrap();
    let report = WorkerReport::new(status).with_result(json!({ "t": secs }));
    assert!(gateway.report(&claimed.id, &agent, report).await.unwrap().is_applied());
}

fn seconds(view: &[cadence::ExecutionInstance]) -> Vec<i64> {
    view.iter()
        .map(|e| e.result.as_ref().and_then(|r| r["t"].as_i64()).unwrap_or(-1))
        .collect()
}

#[tokio::test]
async fn test_consistent_view_restarts_at_each_full_success() {
    let h = Harness::new().await;
    h.storage
        .insert_unit(UnitFixture::new("u1").every(60).full_every(180).build())
        .await
        .unwrap();
    let gateway = h.gateway();
    let results = ResultAggregator::new(h.storage.clone());
    let unit = UnitId::new("u1");

    run_iteration(&h, &gateway, 0, ExecutionStatus::Success).await;
    run_iteration(&h, &gateway, 61, ExecutionStatus::Success).await;
    run_iteration(&h, &gateway, 122, ExecutionStatus::Aborted).await;

    assert_eq!(seconds(&results.latest_results(&unit, false).await.unwrap()), vec![0, 61]);
    assert_eq!(seconds(&results.latest_results(&unit, true).await.unwrap()), vec![61]);

    run_iteration(&h, &gateway, 183, ExecutionStatus::Success).await;
    run_iteration(&h, &gateway, 244, ExecutionStatus::Success).await;

    let executions = h.executions("u1").await;
    let partial: Vec<bool> = executions.iter().map(|e| e.partial).collect();
    assert_eq!(partial, vec![false, true, true, false, true]);
    assert_eq!(seconds(&results.latest_results(&unit, false).await.unwrap()), vec![183, 244]);
    assert_eq!(seconds(&results.latest_results(&unit, true).await.unwrap()), vec![244]);
}

async fn record(State(tx): State<mpsc::UnboundedSender<Value>>, Json(body): Json<Value>) -> StatusCode {
    let _ = tx.send(body);
    StatusCode::OK
}

async fn reject(State(tx): State<mpsc::UnboundedSender<Value>>, Json(body): Json<Value>) -> StatusCode {
    let _ = tx.send(body);
    StatusCode::SERVICE_UNAVAILABLE
}

async fn callback_sink() -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/hook", post(record))
        .route("/down", post(reject))
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, rx)
}

fn notifying_gateway(h: &Harness) -> WorkerGateway {
    let notifier = ResultNotifier::new(
        ResultAggregator::new(h.storage.clone()),
        Arc::new(HttpCallback::new(Duration::from_secs(5)).unwrap()),
    );
    h.gateway().with_notifier(notifier)
}

#[tokio::test]
async fn test_success_posts_consistent_view_to_callback_url() {
    let (addr, mut rx) = callback_sink().await;
    let h = Harness::new().await;
    h.storage
        .insert_unit(
            UnitFixture::new("u1")
                .build()
                .with_integration("gh-1")
                .with_callback_url(format!("http://{}/hook", addr)),
        )
        .await
        .unwrap();
    let gateway = notifying_gateway(&h);

    run_iteration(&h, &gateway, 0, ExecutionStatus::Success).await;

    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("callback not delivered")
        .unwrap();
    let envelope: CallbackEnvelope = serde_json::from_value(body).unwrap();
    assert_eq!(envelope.trigger_id, UnitId::new("u1"));
    assert_eq!(envelope.integration_id.as_ref().map(|i| i.as_str()), Some("gh-1"));
    assert_eq!(envelope.jobs.len(), 1);
    assert_eq!(envelope.jobs[0].status, ExecutionStatus::Success);
    assert_eq!(envelope.jobs[0].result, Some(json!({ "t": 0 })));
}

#[tokio::test]
async fn test_failing_callback_does_not_undo_the_report() {
    let (addr, mut rx) = callback_sink().await;
    let h = Harness::new().await;
    h.storage
        .insert_unit(
            UnitFixture::new("u1")
                .build()
                .with_callback_url(format!("http://{}/down", addr)),
        )
        .await
        .unwrap();
    let gateway = notifying_gateway(&h);

    run_iteration(&h, &gateway, 0, ExecutionStatus::Success).await;

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("callback not attempted")
        .unwrap();
    let executions = h.executions("u1").await;
    assert_eq!(executions[0].status, ExecutionStatus::Success);
}
