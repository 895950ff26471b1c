// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket endpoint: upgrade handling and the per-connection pump.
//!
//! The hub owns all protocol state; this task only moves frames between the
//! socket and the connection's outbound queue. Server frames are produced
//! exclusively through the hub so ordering matches fan-out order.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use crate::channel::Channel;
use crate::error::ErrorCode;
use crate::hub::{ConnAuth, Connection, Hub};
use crate::state::GatewayState;
use crate::transport::ws_msg::{ClientMessage, ServerMessage};

/// `GET /ws` — WebSocket upgrade. Refused while draining.
pub async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if state.maintenance.is_draining() {
        return ErrorCode::Draining
            .to_http_response("gateway is draining; no new connections")
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(state, socket)).into_response()
}

/// Per-connection event loop.
async fn handle_connection(state: Arc<GatewayState>, socket: WebSocket) {
    let (conn, mut outbound_rx) = state.hub.add_connection(ConnAuth::default()).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            _ = conn.cancel.cancelled() => {
                let info = conn.close_info();
                let close = info.map(|i| CloseFrame {
                    code: i.code,
                    reason: i.reason.into(),
                });
                let _ = ws_tx.send(Message::Close(close)).await;
                break;
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        handle_frame(&state.hub, &conn, &text).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = state.hub.remove_connection(&conn.id).await;
}

/// Dispatch one client frame. All replies flow through the outbound queue.
async fn handle_frame(hub: &Hub, conn: &Arc<Connection>, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let frame = ServerMessage::error(
                ErrorCode::InvalidFormat,
                format!("unrecognized message: {e}"),
            );
            hub.send_to_connection(&conn.id, &frame).await;
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { channel, cursor } => {
            let Some(parsed) = Channel::parse(&channel) else {
                send_invalid_channel(hub, conn, channel).await;
                return;
            };
            let _ = hub.subscribe(&conn.id, &parsed, cursor.as_deref()).await;
        }

        ClientMessage::Unsubscribe { channel } => {
            let Some(parsed) = Channel::parse(&channel) else {
                send_invalid_channel(hub, conn, channel).await;
                return;
            };
            hub.unsubscribe(&conn.id, &parsed).await;
        }

        ClientMessage::Backfill { channel, from_cursor, limit } => {
            let Some(parsed) = Channel::parse(&channel) else {
                send_invalid_channel(hub, conn, channel).await;
                return;
            };
            hub.backfill(&conn.id, &parsed, &from_cursor, limit).await;
        }

        ClientMessage::Ping { timestamp } => {
            hub.handle_ping(&conn.id, timestamp).await;
        }

        ClientMessage::Reconnect { cursors } => {
            let _ = hub.handle_reconnect(&conn.id, &cursors).await;
        }

        ClientMessage::Ack { message_ids } => {
            if message_ids.is_empty() {
                let frame = ServerMessage::error(
                    ErrorCode::InvalidFormat,
                    "ack requires at least one message id",
                );
                hub.send_to_connection(&conn.id, &frame).await;
                return;
            }
            let _ = hub.handle_ack(&conn.id, &message_ids).await;
        }
    }
}

async fn send_invalid_channel(hub: &Hub, conn: &Arc<Connection>, channel: String) {
    let frame =
        ServerMessage::channel_error(ErrorCode::InvalidChannel, "unknown channel", channel);
    hub.send_to_connection(&conn.id, &frame).await;
}
