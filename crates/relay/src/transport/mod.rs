// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the gateway.

pub mod http;
pub mod ws;
pub mod ws_msg;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::idempotency::layer::idempotency_layer;
use crate::maintenance::maintenance_layer;
use crate::state::GatewayState;

/// Build the axum `Router` with all gateway routes and middleware.
///
/// Layer order, outermost first: CORS, lifecycle gate + inflight tracking,
/// idempotency. The gate runs before idempotency so a draining gateway
/// refuses mutating traffic without touching the cache.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        // Health & telemetry
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/stats", get(http::stats))
        .route("/api/v1/stats/reset", post(http::stats_reset))
        .route("/api/v1/channels", get(http::channels))
        // Events
        .route("/api/v1/events", post(http::publish_event))
        .route("/api/v1/events/{channel}", get(http::replay_events))
        // Maintenance control
        .route("/api/v1/maintenance", get(http::maintenance_status))
        .route("/api/v1/maintenance/enter", post(http::maintenance_enter))
        .route("/api/v1/maintenance/resume", post(http::maintenance_resume))
        .route("/api/v1/maintenance/drain", post(http::maintenance_drain))
        // WebSocket
        .route("/ws", get(ws::ws_handler))
        // Middleware (innermost listed first)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.idempotency),
            idempotency_layer,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.maintenance),
            maintenance_layer,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
