// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers: health, telemetry, producer publish, stateless replay,
//! and maintenance control.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::error::ErrorCode;
use crate::maintenance::Mode;
use crate::message::MessageMeta;
use crate::state::GatewayState;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: Mode,
    pub connections: usize,
    pub uptime_secs: u64,
    pub version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub channel: String,
    pub r#type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<MessageMeta>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainRequest {
    pub deadline_seconds: u64,
    #[serde(default)]
    pub reason: Option<String>,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: s.maintenance.mode(),
        connections: s.hub.connection_count().await,
        uptime_secs: s.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
    })
}

/// `GET /api/v1/stats`
pub async fn stats(State(s): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(s.hub.stats().await)
}

/// `POST /api/v1/stats/reset`
pub async fn stats_reset(State(s): State<Arc<GatewayState>>) -> impl IntoResponse {
    s.hub.reset_message_stats();
    Json(serde_json::json!({ "reset": true }))
}

/// `GET /api/v1/channels` — active channels with buffer diagnostics.
pub async fn channels(State(s): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(s.hub.channel_infos().await)
}

/// `POST /api/v1/events` — producer publish into the hub.
pub async fn publish_event(
    State(s): State<Arc<GatewayState>>,
    Json(req): Json<PublishRequest>,
) -> impl IntoResponse {
    let Some(channel) = Channel::parse(&req.channel) else {
        return ErrorCode::InvalidChannel
            .to_http_response(format!("unknown channel: {}", req.channel))
            .into_response();
    };
    if req.r#type.is_empty() {
        return ErrorCode::InvalidFormat
            .to_http_response("event type must not be empty")
            .into_response();
    }
    let message = s.hub.publish(&channel, req.r#type, req.payload, req.metadata).await;
    (StatusCode::CREATED, Json(message)).into_response()
}

/// `GET /api/v1/events/{channel}` — stateless catch-up replay.
pub async fn replay_events(
    State(s): State<Arc<GatewayState>>,
    Path(channel): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> impl IntoResponse {
    let Some(channel) = Channel::parse(&channel) else {
        return ErrorCode::InvalidChannel
            .to_http_response(format!("unknown channel: {channel}"))
            .into_response();
    };
    let limit = query.limit.unwrap_or(100);
    Json(s.hub.replay(&channel, query.cursor.as_deref(), limit).await).into_response()
}

/// `GET /api/v1/maintenance`
pub async fn maintenance_status(State(s): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(s.maintenance.snapshot())
}

/// `POST /api/v1/maintenance/enter`
pub async fn maintenance_enter(
    State(s): State<Arc<GatewayState>>,
    body: Option<Json<MaintenanceRequest>>,
) -> impl IntoResponse {
    let reason = body.and_then(|Json(b)| b.reason);
    s.maintenance.start_maintenance(reason);
    Json(s.maintenance.snapshot())
}

/// `POST /api/v1/maintenance/resume`
pub async fn maintenance_resume(State(s): State<Arc<GatewayState>>) -> impl IntoResponse {
    match s.maintenance.resume() {
        Ok(()) => Json(s.maintenance.snapshot()).into_response(),
        Err(code) => {
            code.to_http_response("cannot resume while draining").into_response()
        }
    }
}

/// `POST /api/v1/maintenance/drain`
pub async fn maintenance_drain(
    State(s): State<Arc<GatewayState>>,
    Json(req): Json<DrainRequest>,
) -> impl IntoResponse {
    s.maintenance.start_draining(req.deadline_seconds, req.reason);
    Json(s.maintenance.snapshot())
}
