// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the idempotency middleware: replay, mismatch,
//! key validation, and single-flight coalescing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{middleware, Json, Router};
use axum_test::TestServer;

use relay::idempotency::layer::idempotency_layer;
use relay::idempotency::{IdempotencySettings, IdempotencyState};

/// Counts handler executions so tests can prove coalescing and caching.
#[derive(Clone)]
struct Downstream {
    runs: Arc<AtomicU32>,
    delay: Duration,
    status: StatusCode,
}

async fn create_entity(
    State(downstream): State<Downstream>,
    body: String,
) -> impl IntoResponse {
    if !downstream.delay.is_zero() {
        tokio::time::sleep(downstream.delay).await;
    }
    let run = downstream.runs.fetch_add(1, Ordering::SeqCst) + 1;
    (
        downstream.status,
        [("x-entity-run", run.to_string()), ("x-idempotent-internal", "strip-me".to_owned())],
        Json(serde_json::json!({ "id": format!("e{run}"), "echo": body })),
    )
}

fn test_server(downstream: Downstream, state: Arc<IdempotencyState>) -> TestServer {
    let router = Router::new()
        .route("/x", post(create_entity))
        .layer(middleware::from_fn_with_state(state, idempotency_layer))
        .with_state(downstream);
    TestServer::new(router).expect("failed to create test server")
}

fn quick_downstream(status: StatusCode) -> Downstream {
    Downstream { runs: Arc::new(AtomicU32::new(0)), delay: Duration::ZERO, status }
}

fn idem_state() -> Arc<IdempotencyState> {
    Arc::new(IdempotencyState::new(IdempotencySettings::default()))
}

#[tokio::test]
async fn replay_returns_identical_response() -> anyhow::Result<()> {
    let downstream = quick_downstream(StatusCode::CREATED);
    let server = test_server(downstream.clone(), idem_state());

    let first = server
        .post("/x")
        .add_header("idempotency-key", "k-abcdef12")
        .json(&serde_json::json!({"v": 1}))
        .await;
    first.assert_status(StatusCode::CREATED);
    assert!(first.maybe_header("x-idempotent-replayed").is_none());
    let first_body = first.text();

    let second = server
        .post("/x")
        .add_header("idempotency-key", "k-abcdef12")
        .json(&serde_json::json!({"v": 1}))
        .await;
    second.assert_status(StatusCode::CREATED);
    assert_eq!(second.header("x-idempotent-replayed"), "true");
    assert_eq!(second.text(), first_body, "replay must be byte-identical");
    assert_eq!(second.header("x-entity-run"), "1");
    // Upstream X-Idempotent-* headers are never replayed.
    assert!(second.maybe_header("x-idempotent-internal").is_none());

    assert_eq!(downstream.runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn reused_key_with_different_body_is_rejected() -> anyhow::Result<()> {
    let server = test_server(quick_downstream(StatusCode::CREATED), idem_state());

    server
        .post("/x")
        .add_header("idempotency-key", "k-abcdef12")
        .json(&serde_json::json!({"v": 1}))
        .await
        .assert_status(StatusCode::CREATED);

    let mismatch = server
        .post("/x")
        .add_header("idempotency-key", "k-abcdef12")
        .json(&serde_json::json!({"v": 2}))
        .await;
    mismatch.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = mismatch.json();
    assert_eq!(body["error"]["code"], "IDEMPOTENCY_KEY_MISMATCH");
    Ok(())
}

#[tokio::test]
async fn key_length_is_validated() -> anyhow::Result<()> {
    let server = test_server(quick_downstream(StatusCode::CREATED), idem_state());

    let short = server
        .post("/x")
        .add_header("idempotency-key", "short")
        .json(&serde_json::json!({}))
        .await;
    short.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = short.json();
    assert_eq!(body["error"]["code"], "INVALID_IDEMPOTENCY_KEY");

    let long = server
        .post("/x")
        .add_header("idempotency-key", "k".repeat(257))
        .json(&serde_json::json!({}))
        .await;
    long.assert_status(StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn missing_key_passes_through_uncached() -> anyhow::Result<()> {
    let downstream = quick_downstream(StatusCode::CREATED);
    let server = test_server(downstream.clone(), idem_state());

    for _ in 0..2 {
        let resp = server.post("/x").json(&serde_json::json!({})).await;
        resp.assert_status(StatusCode::CREATED);
        assert!(resp.maybe_header("x-idempotent-replayed").is_none());
    }
    assert_eq!(downstream.runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn server_errors_are_not_cached() -> anyhow::Result<()> {
    let downstream = quick_downstream(StatusCode::INTERNAL_SERVER_ERROR);
    let server = test_server(downstream.clone(), idem_state());

    for _ in 0..2 {
        server
            .post("/x")
            .add_header("idempotency-key", "k-abcdef12")
            .json(&serde_json::json!({}))
            .await
            .assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
    // Both requests reached the handler; nothing was memoized.
    assert_eq!(downstream.runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn client_errors_are_cached() -> anyhow::Result<()> {
    let downstream = quick_downstream(StatusCode::CONFLICT);
    let server = test_server(downstream.clone(), idem_state());

    server
        .post("/x")
        .add_header("idempotency-key", "k-abcdef12")
        .json(&serde_json::json!({}))
        .await
        .assert_status(StatusCode::CONFLICT);
    let replay = server
        .post("/x")
        .add_header("idempotency-key", "k-abcdef12")
        .json(&serde_json::json!({}))
        .await;
    replay.assert_status(StatusCode::CONFLICT);
    assert_eq!(replay.header("x-idempotent-replayed"), "true");
    assert_eq!(downstream.runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_duplicates_coalesce_onto_one_execution() -> anyhow::Result<()> {
    let downstream = Downstream {
        runs: Arc::new(AtomicU32::new(0)),
        delay: Duration::from_millis(150),
        status: StatusCode::CREATED,
    };
    let server = test_server(downstream.clone(), idem_state());

    let body = serde_json::json!({"v": 1});
    let (a, b, c) = tokio::join!(
        server.post("/x").add_header("idempotency-key", "k-abcdef12").json(&body),
        server.post("/x").add_header("idempotency-key", "k-abcdef12").json(&body),
        server.post("/x").add_header("idempotency-key", "k-abcdef12").json(&body),
    );

    assert_eq!(downstream.runs.load(Ordering::SeqCst), 1, "handler must run exactly once");
    for resp in [&a, &b, &c] {
        resp.assert_status(StatusCode::CREATED);
        assert_eq!(resp.text(), a.text(), "all callers share one response");
    }
    let replayed = [&a, &b, &c]
        .iter()
        .filter(|r| r.maybe_header("x-idempotent-replayed").is_some())
        .count();
    assert_eq!(replayed, 2, "exactly the coalesced waiters carry the replay marker");
    Ok(())
}

#[tokio::test]
async fn concurrent_mismatch_is_rejected_while_pending() -> anyhow::Result<()> {
    let downstream = Downstream {
        runs: Arc::new(AtomicU32::new(0)),
        delay: Duration::from_millis(150),
        status: StatusCode::CREATED,
    };
    let server = test_server(downstream.clone(), idem_state());

    let (winner, loser) = tokio::join!(
        server
            .post("/x")
            .add_header("idempotency-key", "k-abcdef12")
            .json(&serde_json::json!({"v": 1})),
        async {
            // Let the leader register its pending entry first.
            tokio::time::sleep(Duration::from_millis(50)).await;
            server
                .post("/x")
                .add_header("idempotency-key", "k-abcdef12")
                .json(&serde_json::json!({"v": 2}))
                .await
        },
    );

    winner.assert_status(StatusCode::CREATED);
    loser.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(downstream.runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn excluded_paths_bypass_the_cache() -> anyhow::Result<()> {
    let downstream = quick_downstream(StatusCode::CREATED);
    let settings = IdempotencySettings {
        exclude_paths: vec!["/x".to_owned()],
        ..IdempotencySettings::default()
    };
    let server = test_server(downstream.clone(), Arc::new(IdempotencyState::new(settings)));

    for _ in 0..2 {
        server
            .post("/x")
            .add_header("idempotency-key", "k-abcdef12")
            .json(&serde_json::json!({}))
            .await
            .assert_status(StatusCode::CREATED);
    }
    assert_eq!(downstream.runs.load(Ordering::SeqCst), 2);
    Ok(())
}
