// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `relay` binary and exercise
//! publishing, fan-out, acknowledgment, idempotency, and drain over real
//! HTTP and WebSocket transports.

use std::time::Duration;

use relay_specs::{
    recv_frame_of_type, send_frame, ws_connect, RelayProcess,
};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn publish(
    client: &reqwest::Client,
    base_url: &str,
    channel: &str,
    r#type: &str,
    payload: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let resp = client
        .post(format!("{base_url}/api/v1/events"))
        .json(&serde_json::json!({
            "channel": channel,
            "type": r#type,
            "payload": payload,
        }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().as_u16() == 201, "publish failed: {}", resp.status());
    Ok(resp.json().await?)
}

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let relay = RelayProcess::start()?;
    relay.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value =
        reqwest::get(format!("{}/api/v1/health", relay.base_url())).await?.json().await?;

    assert_eq!(resp["status"], "running");
    assert_eq!(resp["connections"], 0);
    assert!(resp["version"].is_string());
    Ok(())
}

#[tokio::test]
async fn fan_out_reaches_two_subscribers() -> anyhow::Result<()> {
    let relay = RelayProcess::start()?;
    relay.wait_healthy(TIMEOUT).await?;

    let (mut c1, _) = ws_connect(&relay.ws_url()).await?;
    let (mut c2, _) = ws_connect(&relay.ws_url()).await?;

    for stream in [&mut c1, &mut c2] {
        send_frame(
            stream,
            &serde_json::json!({"type": "subscribe", "channel": "agent:output:a1"}),
        )
        .await?;
        let sub = recv_frame_of_type(stream, "subscribed", TIMEOUT).await?;
        assert_eq!(sub["channel"], "agent:output:a1");
    }

    let client = reqwest::Client::new();
    let published = publish(
        &client,
        &relay.base_url(),
        "agent:output:a1",
        "output.chunk",
        serde_json::json!({"text": "hi"}),
    )
    .await?;

    for stream in [&mut c1, &mut c2] {
        let frame = recv_frame_of_type(stream, "message", TIMEOUT).await?;
        assert_eq!(frame["message"]["type"], "output.chunk");
        assert_eq!(frame["message"]["channel"], "agent:output:a1");
        assert_eq!(frame["message"]["cursor"], published["cursor"]);
        assert!(frame.get("ackRequired").is_none());
    }
    Ok(())
}

#[tokio::test]
async fn ack_round_trip() -> anyhow::Result<()> {
    let relay = RelayProcess::start()?;
    relay.wait_healthy(TIMEOUT).await?;

    let (mut c1, _) = ws_connect(&relay.ws_url()).await?;
    send_frame(
        &mut c1,
        &serde_json::json!({"type": "subscribe", "channel": "workspace:conflicts:w1"}),
    )
    .await?;
    recv_frame_of_type(&mut c1, "subscribed", TIMEOUT).await?;

    let client = reqwest::Client::new();
    publish(
        &client,
        &relay.base_url(),
        "workspace:conflicts:w1",
        "conflict.detected",
        serde_json::json!({"fileId": "f1"}),
    )
    .await?;

    let frame = recv_frame_of_type(&mut c1, "message", TIMEOUT).await?;
    assert_eq!(frame["ackRequired"], true);
    let message_id = frame["message"]["id"].as_str().unwrap_or_default().to_owned();

    send_frame(&mut c1, &serde_json::json!({"type": "ack", "messageIds": [message_id]}))
        .await?;
    let ack = recv_frame_of_type(&mut c1, "ack_response", TIMEOUT).await?;
    assert_eq!(ack["acknowledged"].as_array().map(Vec::len), Some(1));
    assert_eq!(ack["notFound"].as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn reconnect_replays_missed_messages() -> anyhow::Result<()> {
    let relay = RelayProcess::start()?;
    relay.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let a = publish(
        &client,
        &relay.base_url(),
        "workspace:conflicts:w1",
        "conflict.detected",
        serde_json::json!({"n": 1}),
    )
    .await?;
    let b = publish(
        &client,
        &relay.base_url(),
        "workspace:conflicts:w1",
        "conflict.detected",
        serde_json::json!({"n": 2}),
    )
    .await?;

    let (mut c1, _) = ws_connect(&relay.ws_url()).await?;
    send_frame(
        &mut c1,
        &serde_json::json!({
            "type": "reconnect",
            "cursors": {"workspace:conflicts:w1": a["cursor"]},
        }),
    )
    .await?;

    let replayed = recv_frame_of_type(&mut c1, "message", TIMEOUT).await?;
    assert_eq!(replayed["message"]["id"], b["id"]);
    assert_eq!(replayed["ackRequired"], true);

    let ack = recv_frame_of_type(&mut c1, "reconnect_ack", TIMEOUT).await?;
    assert_eq!(ack["replayed"]["workspace:conflicts:w1"], 1);
    assert_eq!(ack["expired"].as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn ping_pong_carries_subscription_state() -> anyhow::Result<()> {
    let relay = RelayProcess::start()?;
    relay.wait_healthy(TIMEOUT).await?;

    let (mut c1, _) = ws_connect(&relay.ws_url()).await?;
    send_frame(&mut c1, &serde_json::json!({"type": "subscribe", "channel": "system:health"}))
        .await?;
    recv_frame_of_type(&mut c1, "subscribed", TIMEOUT).await?;

    send_frame(&mut c1, &serde_json::json!({"type": "ping", "timestamp": 42})).await?;
    let pong = recv_frame_of_type(&mut c1, "pong", TIMEOUT).await?;
    assert_eq!(pong["timestamp"], 42);
    assert_eq!(pong["subscriptions"][0], "system:health");
    assert!(pong["serverTime"].is_string());
    Ok(())
}

#[tokio::test]
async fn malformed_frames_get_invalid_format_errors() -> anyhow::Result<()> {
    let relay = RelayProcess::start()?;
    relay.wait_healthy(TIMEOUT).await?;

    let (mut c1, _) = ws_connect(&relay.ws_url()).await?;

    send_frame(&mut c1, &serde_json::json!({"type": "shout", "volume": 11})).await?;
    let err = recv_frame_of_type(&mut c1, "error", TIMEOUT).await?;
    assert_eq!(err["code"], "INVALID_FORMAT");

    send_frame(&mut c1, &serde_json::json!({"type": "subscribe", "channel": "db:events:x"}))
        .await?;
    let err = recv_frame_of_type(&mut c1, "error", TIMEOUT).await?;
    assert_eq!(err["code"], "INVALID_CHANNEL");
    assert_eq!(err["channel"], "db:events:x");
    Ok(())
}

#[tokio::test]
async fn idempotent_publish_replays_identically() -> anyhow::Result<()> {
    let relay = RelayProcess::start()?;
    relay.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/events", relay.base_url());
    let body = serde_json::json!({
        "channel": "user:mail:u1",
        "type": "mail.received",
        "payload": {"v": 1},
    });

    let first = client
        .post(&url)
        .header("idempotency-key", "k-abcdef12")
        .json(&body)
        .send()
        .await?;
    assert_eq!(first.status().as_u16(), 201);
    assert!(first.headers().get("x-idempotent-replayed").is_none());
    let first_body = first.text().await?;

    let second = client
        .post(&url)
        .header("idempotency-key", "k-abcdef12")
        .json(&body)
        .send()
        .await?;
    assert_eq!(second.status().as_u16(), 201);
    assert_eq!(
        second.headers().get("x-idempotent-replayed").and_then(|v| v.to_str().ok()),
        Some("true")
    );
    assert_eq!(second.text().await?, first_body);

    let mismatch = client
        .post(&url)
        .header("idempotency-key", "k-abcdef12")
        .json(&serde_json::json!({
            "channel": "user:mail:u1",
            "type": "mail.received",
            "payload": {"v": 2},
        }))
        .send()
        .await?;
    assert_eq!(mismatch.status().as_u16(), 422);
    let err: serde_json::Value = mismatch.json().await?;
    assert_eq!(err["error"]["code"], "IDEMPOTENCY_KEY_MISMATCH");
    Ok(())
}

#[tokio::test]
async fn drain_gates_mutations_and_refuses_upgrades() -> anyhow::Result<()> {
    let relay = RelayProcess::start()?;
    relay.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/v1/maintenance/drain", relay.base_url()))
        .json(&serde_json::json!({"deadlineSeconds": 5, "reason": "test"}))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 200);

    let refused = client
        .post(format!("{}/api/v1/events", relay.base_url()))
        .json(&serde_json::json!({
            "channel": "agent:output:a1",
            "type": "output.chunk",
            "payload": {},
        }))
        .send()
        .await?;
    assert_eq!(refused.status().as_u16(), 503);
    assert!(refused.headers().get("retry-after").is_some());
    let err: serde_json::Value = refused.json().await?;
    assert_eq!(err["error"]["code"], "DRAINING");

    // Reads stay up.
    let health = reqwest::get(format!("{}/api/v1/health", relay.base_url())).await?;
    assert_eq!(health.status().as_u16(), 200);

    // New WebSocket upgrades are refused.
    assert!(tokio_tungstenite::connect_async(relay.ws_url()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn sigterm_exits_cleanly_within_deadline() -> anyhow::Result<()> {
    let mut relay = RelayProcess::start_with_drain_deadline(2)?;
    relay.wait_healthy(TIMEOUT).await?;

    relay.signal_term()?;
    let status = relay.wait_exit(Duration::from_secs(6)).await?;
    assert!(status.success(), "expected clean exit, got {status:?}");
    Ok(())
}
