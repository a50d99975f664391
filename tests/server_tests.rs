mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use optic_poll_rs::server::{router, AppState};
use optic_poll_rs::sink::MemorySink;

use common::{Behavior, MockNetwork};

async fn state(net: std::sync::Arc<MockNetwork>, n: u32) -> AppState {
    let devices = common::devices(n);
    let sink = MemorySink::new();
    sink.seed(&devices).await;
    let poller = common::poller(net, &sink);
    AppState::new(poller, sink, devices, common::config(), CancellationToken::new())
}

async fn call(app: &axum::Router, method: &str, uri: &str) -> (StatusCode, Option<Value>) {
    let req = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&bytes).unwrap())
    };
    (status, json)
}

#[tokio::test]
async fn idle_server_has_no_report() {
    let app = router(state(MockNetwork::new(common::healthy()), 2).await);

    let (status, body) = call(&app, "GET", "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["state"], "idle");

    let (status, body) = call(&app, "GET", "/api/report").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_none());
}

#[tokio::test]
async fn report_and_devices_after_a_cycle() {
    let st = state(MockNetwork::new(common::healthy()), 3).await;
    st.poll_once().await.unwrap();
    let app = router(st);

    let (status, body) = call(&app, "GET", "/api/report").await;
    assert_eq!(status, StatusCode::OK);
    let report = body.unwrap();
    assert_eq!(report["total"], 3);
    assert_eq!(report["succeeded"], 3);
    assert_eq!(report["outcomes"].as_array().unwrap().len(), 3);

    let (status, body) = call(&app, "GET", "/api/devices").await;
    assert_eq!(status, StatusCode::OK);
    let devices = body.unwrap();
    let devices = devices.as_array().unwrap();
    assert_eq!(devices.len(), 3);
    assert_eq!(devices[0]["alive"], true);
    assert_eq!(devices[0]["vendor"], "Acme");

    let (_, body) = call(&app, "GET", "/api/status").await;
    let status = body.unwrap();
    assert_eq!(status["state"], "done");
    assert_eq!(status["done"], 3);
}

#[tokio::test]
async fn second_poll_while_running_conflicts() {
    let net = MockNetwork::new(Behavior::slow(
        common::switch_table(common::ACME_ENTERPRISE, -1250, -1000),
        Duration::from_millis(50),
    ));
    let app = router(state(net, 4).await);

    let (status, body) = call(&app, "POST", "/api/poll").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body.unwrap()["state"], "running");

    let (status, body) = call(&app, "POST", "/api/poll").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.unwrap()["error"].as_str().unwrap().contains("already running"));
}

#[tokio::test]
async fn poll_once_rejects_overlap() {
    let net = MockNetwork::new(Behavior::slow(
        common::switch_table(common::ACME_ENTERPRISE, -1250, -1000),
        Duration::from_millis(20),
    ));
    let st = state(net, 2).await;
    let (a, b) = tokio::join!(st.poll_once(), st.poll_once());
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
}
