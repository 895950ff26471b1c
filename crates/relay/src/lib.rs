// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay: real-time fan-out gateway for agent orchestration.
//!
//! The hub multiplexes agent, workspace, user, and system event streams to
//! long-lived WebSocket clients with bounded per-channel history and
//! cursor-based resume. Mutating HTTP is wrapped by an idempotency cache
//! and gated by the drain/maintenance controller.

pub mod channel;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod idempotency;
pub mod maintenance;
pub mod message;
pub mod ring;
pub mod state;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::GatewayConfig;
use crate::heartbeat::spawn_heartbeat;
use crate::hub::{Hub, HubSettings};
use crate::idempotency::{spawn_sweeper, IdempotencySettings, IdempotencyState};
use crate::maintenance::MaintenanceState;
use crate::state::GatewayState;
use crate::transport::build_router;

/// WebSocket close code for server shutdown ("going away").
const CLOSE_GOING_AWAY: u16 = 1001;

/// Run the gateway until shutdown.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();
    let jobs = CancellationToken::new();

    let hub = Arc::new(Hub::new(HubSettings {
        heartbeat_interval_ms: config.heartbeat_interval_ms,
        ..HubSettings::default()
    }));
    let idempotency = Arc::new(IdempotencyState::new(IdempotencySettings {
        ttl: config.idempotency_ttl(),
        max_records: config.idempotency_max_records,
        ..IdempotencySettings::default()
    }));
    let maintenance = Arc::new(MaintenanceState::new());

    spawn_heartbeat(
        Arc::clone(&hub),
        config.heartbeat_interval(),
        config.connection_timeout(),
        jobs.clone(),
    );
    spawn_sweeper(Arc::clone(&idempotency), config.cleanup_interval(), jobs.clone());
    spawn_buffer_cleanup(Arc::clone(&hub), config.cleanup_interval(), jobs.clone());
    spawn_signal_handler(shutdown.clone());

    let state = Arc::new(GatewayState::new(
        config.clone(),
        Arc::clone(&hub),
        Arc::clone(&idempotency),
        Arc::clone(&maintenance),
    ));
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    info!("relay listening on {addr}");

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        res = server => res?,
        _ = drain_sequence(
            shutdown,
            jobs,
            Arc::clone(&hub),
            Arc::clone(&maintenance),
            config.drain_deadline_seconds,
        ) => {}
    }
    Ok(())
}

/// Shutdown sequence: gate mutating traffic, stop periodic jobs, wait for
/// in-flight work up to the deadline, then force-close what remains.
async fn drain_sequence(
    shutdown: CancellationToken,
    jobs: CancellationToken,
    hub: Arc<Hub>,
    maintenance: Arc<MaintenanceState>,
    deadline_seconds: u64,
) {
    shutdown.cancelled().await;

    let deadline = if maintenance.is_draining() {
        Duration::from_secs(maintenance.retry_after_secs().unwrap_or(deadline_seconds))
    } else {
        maintenance.start_draining(deadline_seconds, Some("shutdown signal".to_owned()))
    };
    jobs.cancel();

    let drained = maintenance.wait_for_drain(deadline).await;
    let closed = hub.close_all(CLOSE_GOING_AWAY, "server shutting down").await;
    info!(drained, closed, "shutdown complete");
}

/// First SIGTERM/SIGINT starts the graceful drain; a second one forces
/// immediate exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(1);
    });
}

/// Periodically prune expired buffer entries and drop unused buffers.
fn spawn_buffer_cleanup(hub: Arc<Hub>, interval: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            let pruned = hub.prune_buffers().await;
            let dropped = hub.prune_unused_buffers().await;
            if pruned > 0 || dropped > 0 {
                tracing::debug!(pruned, dropped, "buffer cleanup");
            }
        }
    });
}
