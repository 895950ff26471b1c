// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection bookkeeping: subscriptions, pending acks, heartbeat,
//! and the bounded outbound frame queue.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::{epoch_ms, HubMessage};

/// Outbound frames buffered per connection before the transport task drains
/// them. Overflow closes the connection; the publisher never blocks.
pub const OUTBOUND_QUEUE_CAP: usize = 1_000;

/// Opaque authentication context attached at admission. Populated by the
/// edge layer; the hub only carries it.
#[derive(Debug, Clone, Default)]
pub struct ConnAuth {
    pub subject: Option<String>,
    pub claims: serde_json::Value,
}

/// Close parameters recorded before the cancel token fires so the transport
/// task can emit a proper close frame.
#[derive(Debug, Clone)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// Message delivered on an ack-required channel, held until the client
/// acknowledges it or the connection dies.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message: HubMessage,
    pub sent_at: Instant,
    pub replay_count: u32,
}

/// Mutable connection state, guarded by the connection's own lock.
///
/// Lock ordering: this lock is acquired after any hub-level map lock,
/// never before.
#[derive(Debug)]
pub struct ConnState {
    /// channel -> last delivered cursor (encoded), if any.
    pub subscriptions: HashMap<String, Option<String>>,
    /// message id -> pending ack entry.
    pub pending_acks: HashMap<String, PendingAck>,
    pub last_heartbeat: Instant,
}

/// One client connection registered with the hub.
pub struct Connection {
    pub id: String,
    pub connected_at_ms: u64,
    pub auth: ConnAuth,
    pub cancel: CancellationToken,
    outbound: mpsc::Sender<std::sync::Arc<str>>,
    close_info: Mutex<Option<CloseInfo>>,
    state: Mutex<ConnState>,
}

/// Why an enqueue did not reach the connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Outbound queue at capacity; the connection must be closed.
    QueueFull,
    /// Receiver side is gone (transport task exited).
    Closed,
}

impl Connection {
    pub fn new(id: String, auth: ConnAuth, outbound: mpsc::Sender<std::sync::Arc<str>>) -> Self {
        Self {
            id,
            connected_at_ms: epoch_ms(),
            auth,
            cancel: CancellationToken::new(),
            outbound,
            close_info: Mutex::new(None),
            state: Mutex::new(ConnState {
                subscriptions: HashMap::new(),
                pending_acks: HashMap::new(),
                last_heartbeat: Instant::now(),
            }),
        }
    }

    /// Non-blocking enqueue onto the bounded outbound queue.
    pub fn enqueue(&self, frame: std::sync::Arc<str>) -> Result<(), EnqueueError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    pub fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record close parameters and fire the cancel token. Idempotent; the
    /// first close wins.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut info = self.close_info.lock().unwrap_or_else(PoisonError::into_inner);
            if info.is_none() {
                *info = Some(CloseInfo { code, reason: reason.into() });
            }
        }
        self.cancel.cancel();
    }

    pub fn close_info(&self) -> Option<CloseInfo> {
        self.close_info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected_at_ms", &self.connected_at_ms)
            .finish()
    }
}
