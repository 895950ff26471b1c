// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic heartbeat broadcast and dead-connection reaper.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::hub::Hub;
use crate::message::iso_now;
use crate::transport::ws_msg::ServerMessage;

/// Close code sent when a connection misses its heartbeat window.
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Spawn the heartbeat loop: broadcast a `heartbeat` frame every `interval`
/// and close connections whose last heartbeat is older than `timeout`.
/// Cancelling the token stops the loop; stopping twice is a no-op.
pub fn spawn_heartbeat(
    hub: Arc<Hub>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh start does not
        // double-broadcast.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            hub.broadcast(&ServerMessage::Heartbeat { server_time: iso_now() }).await;

            for id in hub.dead_connections(timeout).await {
                tracing::info!(connection_id = %id, "closing connection after heartbeat timeout");
                hub.close_connection(&id, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout").await;
            }
        }
    })
}
