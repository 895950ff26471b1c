// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The fan-out hub: connection registry, subscription directory, per-channel
//! bounded history, ack tracking, and reconnect replay.
//!
//! Lock ordering, outermost first: buffers map, channel buffer, connections
//! map, subscribers map, connection state. A channel's buffer lock is held
//! across fan-out so concurrent publishes to the same channel deliver in
//! sequence order; buffers of different channels are independent. The
//! subscribers lock is never held while acquiring a buffer lock.
//!
//! Every frame is serialized once and shared across subscribers. Sends are
//! non-blocking: a full outbound queue closes the connection, a gone
//! receiver only bumps the send-failure counters. The heartbeat reaper is
//! the sole remover of dead connections.

pub mod connection;
pub mod stats;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::channel::{retention_for, AckPolicy, Channel};
use crate::error::ErrorCode;
use crate::message::{epoch_ms, iso_from_ms, iso_now, Cursor, HubMessage, MessageMeta};
use crate::ring::{RingBuffer, RingCounters};
use crate::transport::ws_msg::{Capabilities, ServerMessage};

pub use connection::{
    ConnAuth, ConnState, Connection, EnqueueError, PendingAck, OUTBOUND_QUEUE_CAP,
};
pub use stats::{ChannelInfo, HubStats, LossCounters, LossStats};

/// WebSocket close code used when a connection exceeds its bounds.
const CLOSE_RATE_LIMITED: u16 = 4429;

/// Hub-wide tunables.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Advertised in the `connected` frame.
    pub heartbeat_interval_ms: u64,
    pub ack_policy: AckPolicy,
    /// Unacknowledged messages a connection may hold before it is closed.
    pub pending_ack_cap: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            ack_policy: AckPolicy::default(),
            pending_ack_cap: 10_000,
        }
    }
}

type SharedBuffer = Arc<Mutex<RingBuffer<HubMessage>>>;

/// Result of registering a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// Last delivered cursor after replay, if any.
    pub cursor: Option<String>,
    /// Missed messages delivered as part of the subscribe.
    pub replayed: usize,
    /// The supplied cursor was invalid or expired and the full retained
    /// history was delivered instead. Only `reconnect` surfaces this to the
    /// client; plain subscribers infer it from cursor validity.
    pub expired: bool,
}

/// Result of a stateless catch-up read.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub messages: Vec<HubMessage>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<String>,
    pub expired: bool,
}

/// Result of acknowledging a batch of message ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    pub acknowledged: Vec<String>,
    pub not_found: Vec<String>,
}

/// Result of a reconnect with per-channel resume cursors.
#[derive(Debug, Clone, Default)]
pub struct ReconnectOutcome {
    pub replayed: HashMap<String, usize>,
    pub expired: Vec<String>,
    pub new_cursors: HashMap<String, String>,
    pub pending_acks_replayed: usize,
}

struct RateWindow {
    count: u64,
    since: Instant,
}

/// The in-process publish/subscribe broker.
pub struct Hub {
    settings: HubSettings,
    buffers: RwLock<HashMap<String, SharedBuffer>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    subscribers: RwLock<HashMap<String, HashSet<String>>>,
    rate: std::sync::Mutex<RateWindow>,
    send_failures: AtomicU64,
    send_failures_by_prefix: std::sync::Mutex<HashMap<String, u64>>,
    /// Loss counters carried over from buffers dropped by the cleanup sweep.
    retired_loss: std::sync::Mutex<HashMap<String, LossCounters>>,
    /// Epoch millis of the most recent send failure; 0 = never.
    last_send_drop_ms: AtomicU64,
    expired_cursor_resumes: AtomicU64,
}

impl Hub {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            settings,
            buffers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            rate: std::sync::Mutex::new(RateWindow { count: 0, since: Instant::now() }),
            send_failures: AtomicU64::new(0),
            send_failures_by_prefix: std::sync::Mutex::new(HashMap::new()),
            retired_loss: std::sync::Mutex::new(HashMap::new()),
            last_send_drop_ms: AtomicU64::new(0),
            expired_cursor_resumes: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    // -- Connection lifecycle -------------------------------------------------

    /// Register a new connection and emit its `connected` frame. Returns the
    /// handle together with the receiving end of its outbound queue, which
    /// the transport task drains.
    pub async fn add_connection(
        &self,
        auth: ConnAuth,
    ) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAP);
        let id = uuid::Uuid::new_v4().to_string();
        let conn = Arc::new(Connection::new(id.clone(), auth, tx));
        self.connections.write().await.insert(id.clone(), Arc::clone(&conn));

        let hello = ServerMessage::Connected {
            connection_id: id.clone(),
            server_time: iso_now(),
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            capabilities: Capabilities::default(),
            heartbeat_interval_ms: self.settings.heartbeat_interval_ms,
        };
        if conn.enqueue(serialize_frame(&hello)).is_err() {
            tracing::debug!(connection_id = %id, "connected frame not deliverable");
        }
        tracing::debug!(connection_id = %id, "connection registered");
        (conn, rx)
    }

    /// Remove a connection and purge it from every subscription index.
    /// Pending acks die with it.
    pub async fn remove_connection(&self, id: &str) -> Option<Arc<Connection>> {
        let conn = self.connections.write().await.remove(id)?;
        let channels: Vec<String> = conn.state().subscriptions.keys().cloned().collect();
        if !channels.is_empty() {
            let mut subs = self.subscribers.write().await;
            for channel in channels {
                if let Some(set) = subs.get_mut(&channel) {
                    set.remove(id);
                    if set.is_empty() {
                        subs.remove(&channel);
                    }
                }
            }
        }
        tracing::debug!(connection_id = %id, "connection removed");
        Some(conn)
    }

    /// Close the transport (via the connection's cancel token) and remove
    /// the connection from the hub.
    pub async fn close_connection(&self, id: &str, code: u16, reason: &str) {
        if let Some(conn) = self.connection(id).await {
            conn.close(code, reason);
        }
        let _ = self.remove_connection(id).await;
    }

    /// Close every connection. Used on shutdown after the drain deadline.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let conns: Vec<Arc<Connection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        self.subscribers.write().await.clear();
        for conn in &conns {
            conn.close(code, reason);
        }
        conns.len()
    }

    pub async fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    // -- Subscriptions --------------------------------------------------------

    /// Register a subscription, replaying missed messages when a cursor is
    /// supplied. A valid cursor replays strictly after it; an invalid or
    /// expired cursor replays the full retained history.
    pub async fn subscribe(
        &self,
        conn_id: &str,
        channel: &Channel,
        cursor: Option<&str>,
    ) -> Option<SubscribeOutcome> {
        let conn = self.connection(conn_id).await?;
        let canonical = channel.canonical();
        let prefix = channel.prefix();
        let ack_required = self.settings.ack_policy.requires_ack(&canonical);

        let buffer = self.get_or_create_buffer(channel).await;
        let buf = buffer.lock().await;

        self.subscribers
            .write()
            .await
            .entry(canonical.clone())
            .or_default()
            .insert(conn.id.clone());

        let (missed, expired): (Vec<HubMessage>, bool) = match cursor {
            None => (Vec::new(), false),
            Some(raw) => match Cursor::decode(raw) {
                Some(c) if buf.is_valid_cursor(c) => {
                    (buf.slice(c, None).into_iter().cloned().collect(), false)
                }
                _ => {
                    self.expired_cursor_resumes.fetch_add(1, Ordering::Relaxed);
                    (buf.get_all(None).into_iter().cloned().collect(), true)
                }
            },
        };

        let resume_cursor = missed
            .last()
            .map(|m| m.cursor.clone())
            .or_else(|| if expired { None } else { cursor.map(str::to_owned) });

        let replayed = missed.len();
        {
            let mut st = conn.state();
            st.subscriptions.insert(canonical.clone(), resume_cursor.clone());

            let subscribed = ServerMessage::Subscribed {
                channel: canonical.clone(),
                cursor: resume_cursor.clone(),
            };
            if conn.enqueue(serialize_frame(&subscribed)).is_err() {
                self.record_send_failure(&prefix);
            }

            for msg in &missed {
                let frame = serialize_frame(&ServerMessage::message(msg.clone(), ack_required));
                if !self.deliver_message(&conn, &mut st, &canonical, &prefix, msg, &frame, ack_required)
                {
                    break;
                }
            }
        }
        drop(buf);

        tracing::debug!(
            connection_id = %conn_id,
            channel = %canonical,
            replayed,
            expired,
            "subscribed"
        );
        Some(SubscribeOutcome { cursor: resume_cursor, replayed, expired })
    }

    pub async fn unsubscribe(&self, conn_id: &str, channel: &Channel) -> bool {
        let Some(conn) = self.connection(conn_id).await else {
            return false;
        };
        let canonical = channel.canonical();
        {
            let mut subs = self.subscribers.write().await;
            if let Some(set) = subs.get_mut(&canonical) {
                set.remove(conn_id);
                if set.is_empty() {
                    subs.remove(&canonical);
                }
            }
        }
        let existed = conn.state().subscriptions.remove(&canonical).is_some();
        let frame = ServerMessage::Unsubscribed { channel: canonical };
        let _ = conn.enqueue(serialize_frame(&frame));
        existed
    }

    // -- Publish --------------------------------------------------------------

    /// Build, store, and fan out a message. Completes once every subscriber's
    /// outbound queue has been offered the frame; transport flush is not
    /// awaited.
    pub async fn publish(
        &self,
        channel: &Channel,
        r#type: impl Into<String>,
        payload: serde_json::Value,
        metadata: Option<MessageMeta>,
    ) -> HubMessage {
        let canonical = channel.canonical();
        let prefix = channel.prefix();
        let ack_required = self.settings.ack_policy.requires_ack(&canonical);

        let buffer = self.get_or_create_buffer(channel).await;
        let mut buf = buffer.lock().await;

        let mut msg = HubMessage::new(canonical.clone(), r#type.into(), payload, metadata);
        buf.push_with(|cursor| {
            msg.cursor = cursor.encode();
            msg.clone()
        });

        {
            let mut rate = self.rate.lock().unwrap_or_else(PoisonError::into_inner);
            rate.count += 1;
        }

        let subscriber_ids: Vec<String> = {
            let subs = self.subscribers.read().await;
            subs.get(&canonical).map(|s| s.iter().cloned().collect()).unwrap_or_default()
        };

        if !subscriber_ids.is_empty() {
            let frame = serialize_frame(&ServerMessage::message(msg.clone(), ack_required));
            let conns = self.connections.read().await;
            for id in &subscriber_ids {
                let Some(conn) = conns.get(id) else { continue };
                let mut st = conn.state();
                self.deliver_message(conn, &mut st, &canonical, &prefix, &msg, &frame, ack_required);
            }
        }

        // Buffer lock released on return; the next publish on this channel
        // fans out only after this one has enqueued everywhere.
        drop(buf);
        msg
    }

    /// Offer one frame to one subscriber, updating its cursor and ack state.
    /// Returns false when delivery stopped (failure or close).
    fn deliver_message(
        &self,
        conn: &Connection,
        st: &mut ConnState,
        canonical: &str,
        prefix: &str,
        msg: &HubMessage,
        frame: &Arc<str>,
        ack_required: bool,
    ) -> bool {
        // The subscription may have been dropped between the index snapshot
        // and this connection's lock.
        if !st.subscriptions.contains_key(canonical) {
            return false;
        }

        if ack_required && st.pending_acks.len() >= self.settings.pending_ack_cap {
            let throttled = ServerMessage::Throttled {
                message: "pending acknowledgment limit exceeded".to_owned(),
                resume_after_ms: 1_000,
                current_count: Some(st.pending_acks.len()),
                limit: Some(self.settings.pending_ack_cap),
            };
            let _ = conn.enqueue(serialize_frame(&throttled));
            conn.close(CLOSE_RATE_LIMITED, ErrorCode::RateLimited.as_str());
            tracing::warn!(
                connection_id = %conn.id,
                pending = st.pending_acks.len(),
                "closing connection over pending-ack cap"
            );
            return false;
        }

        match conn.enqueue(Arc::clone(frame)) {
            Ok(()) => {
                st.subscriptions.insert(canonical.to_owned(), Some(msg.cursor.clone()));
                if ack_required {
                    st.pending_acks.insert(
                        msg.id.clone(),
                        PendingAck {
                            message: msg.clone(),
                            sent_at: Instant::now(),
                            replay_count: 0,
                        },
                    );
                }
                true
            }
            Err(EnqueueError::QueueFull) => {
                self.record_send_failure(prefix);
                conn.close(CLOSE_RATE_LIMITED, ErrorCode::RateLimited.as_str());
                tracing::warn!(
                    connection_id = %conn.id,
                    "closing connection over outbound queue overflow"
                );
                false
            }
            Err(EnqueueError::Closed) => {
                // Dead connections are reaped by the heartbeat loop, not here.
                self.record_send_failure(prefix);
                false
            }
        }
    }

    // -- Acknowledgments ------------------------------------------------------

    /// Remove acknowledged ids from the connection's pending set and report
    /// ids that were not pending. Acking the same id twice reports it
    /// `not_found` the second time.
    pub async fn handle_ack(&self, conn_id: &str, message_ids: &[String]) -> Option<AckOutcome> {
        let conn = self.connection(conn_id).await?;
        let mut outcome = AckOutcome::default();
        {
            let mut st = conn.state();
            for id in message_ids {
                if st.pending_acks.remove(id).is_some() {
                    outcome.acknowledged.push(id.clone());
                } else {
                    outcome.not_found.push(id.clone());
                }
            }
        }
        let frame = ServerMessage::AckResponse {
            acknowledged: outcome.acknowledged.clone(),
            not_found: outcome.not_found.clone(),
        };
        let _ = conn.enqueue(serialize_frame(&frame));
        Some(outcome)
    }

    /// Re-send every still-pending message, bumping replay counts.
    pub async fn replay_pending_acks(&self, conn_id: &str) -> usize {
        let Some(conn) = self.connection(conn_id).await else {
            return 0;
        };
        let mut st = conn.state();
        self.replay_pending_locked(&conn, &mut st, None)
    }

    fn replay_pending_locked(
        &self,
        conn: &Connection,
        st: &mut ConnState,
        only: Option<&HashSet<String>>,
    ) -> usize {
        let mut entries: Vec<(String, HubMessage)> = st
            .pending_acks
            .iter()
            .filter(|(id, _)| only.is_none_or(|set| set.contains(*id)))
            .map(|(id, p)| (id.clone(), p.message.clone()))
            .collect();
        entries.sort_by(|a, b| a.1.cursor.cmp(&b.1.cursor));

        let mut replayed = 0;
        for (id, message) in entries {
            let frame = serialize_frame(&ServerMessage::message(message.clone(), true));
            match conn.enqueue(frame) {
                Ok(()) => {
                    if let Some(p) = st.pending_acks.get_mut(&id) {
                        p.replay_count += 1;
                        p.sent_at = Instant::now();
                    }
                    replayed += 1;
                }
                Err(EnqueueError::QueueFull) => {
                    self.record_send_failure(Channel::prefix_of(&message.channel));
                    conn.close(CLOSE_RATE_LIMITED, ErrorCode::RateLimited.as_str());
                    break;
                }
                Err(EnqueueError::Closed) => {
                    self.record_send_failure(Channel::prefix_of(&message.channel));
                    break;
                }
            }
        }
        replayed
    }

    pub async fn pending_ack_count(&self, conn_id: &str) -> usize {
        match self.connection(conn_id).await {
            Some(conn) => conn.state().pending_acks.len(),
            None => 0,
        }
    }

    // -- Replay / reconnect ---------------------------------------------------

    /// Stateless catch-up read from a channel's buffer. `expired` is set when
    /// a cursor was supplied but no longer resolves.
    pub async fn replay(
        &self,
        channel: &Channel,
        cursor: Option<&str>,
        limit: usize,
    ) -> ReplayResult {
        let canonical = channel.canonical();
        let buffer = { self.buffers.read().await.get(&canonical).cloned() };
        let Some(buffer) = buffer else {
            return ReplayResult {
                messages: Vec::new(),
                has_more: false,
                last_cursor: None,
                expired: cursor.is_some(),
            };
        };

        let buf = buffer.lock().await;
        let (items, expired) = match cursor {
            None => (buf.get_all(Some(limit)), false),
            Some(raw) => match Cursor::decode(raw) {
                Some(c) if buf.is_valid_cursor(c) => (buf.slice(c, Some(limit)), false),
                _ => {
                    self.expired_cursor_resumes.fetch_add(1, Ordering::Relaxed);
                    (buf.get_all(Some(limit)), true)
                }
            },
        };
        let messages: Vec<HubMessage> = items.into_iter().cloned().collect();
        let last_cursor = messages.last().map(|m| m.cursor.clone());
        let has_more = match (last_cursor.as_deref().and_then(Cursor::decode), buf.latest_cursor())
        {
            (Some(last), Some(latest)) => last.seq < latest.seq,
            _ => false,
        };
        ReplayResult { messages, has_more, last_cursor, expired }
    }

    /// Serve a `backfill` request over the connection's outbound queue.
    pub async fn backfill(
        &self,
        conn_id: &str,
        channel: &Channel,
        from_cursor: &str,
        limit: Option<usize>,
    ) {
        let result = self.replay(channel, Some(from_cursor), limit.unwrap_or(100)).await;
        let frame = ServerMessage::BackfillResponse {
            channel: channel.canonical(),
            messages: result.messages,
            last_cursor: result.last_cursor,
            has_more: result.has_more,
        };
        self.send_to_connection(conn_id, &frame).await;
    }

    /// Resume a set of channels at the given cursors: re-subscribe each,
    /// deliver missed messages, then replay acks that were already pending
    /// before the reconnect. Emits the `reconnect_ack` frame.
    pub async fn handle_reconnect(
        &self,
        conn_id: &str,
        cursors: &HashMap<String, String>,
    ) -> Option<ReconnectOutcome> {
        let conn = self.connection(conn_id).await?;
        let pre_existing: HashSet<String> = conn.state().pending_acks.keys().cloned().collect();

        let mut outcome = ReconnectOutcome::default();
        let mut entries: Vec<(&String, &String)> = cursors.iter().collect();
        entries.sort();

        for (channel_str, cursor) in entries {
            let Some(channel) = Channel::parse(channel_str) else {
                let frame = ServerMessage::channel_error(
                    ErrorCode::InvalidChannel,
                    "unknown channel",
                    channel_str.clone(),
                );
                let _ = conn.enqueue(serialize_frame(&frame));
                continue;
            };
            let Some(sub) = self.subscribe(conn_id, &channel, Some(cursor)).await else {
                break;
            };
            outcome.replayed.insert(channel_str.clone(), sub.replayed);
            if sub.expired {
                outcome.expired.push(channel_str.clone());
            }
            if let Some(c) = sub.cursor {
                outcome.new_cursors.insert(channel_str.clone(), c);
            }
        }

        outcome.pending_acks_replayed = {
            let mut st = conn.state();
            self.replay_pending_locked(&conn, &mut st, Some(&pre_existing))
        };

        let frame = ServerMessage::ReconnectAck {
            replayed: outcome.replayed.clone(),
            expired: outcome.expired.clone(),
            new_cursors: outcome.new_cursors.clone(),
            pending_acks_replayed: Some(outcome.pending_acks_replayed),
        };
        let _ = conn.enqueue(serialize_frame(&frame));
        Some(outcome)
    }

    // -- Heartbeat ------------------------------------------------------------

    pub async fn update_heartbeat(&self, conn_id: &str) -> bool {
        match self.connection(conn_id).await {
            Some(conn) => {
                conn.state().last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Answer a client ping: refresh the heartbeat and report current
    /// subscriptions with their cursors.
    pub async fn handle_ping(&self, conn_id: &str, timestamp: u64) -> bool {
        let Some(conn) = self.connection(conn_id).await else {
            return false;
        };
        let (subscriptions, cursors) = {
            let mut st = conn.state();
            st.last_heartbeat = Instant::now();
            let mut subscriptions: Vec<String> = st.subscriptions.keys().cloned().collect();
            subscriptions.sort();
            let cursors: HashMap<String, String> = st
                .subscriptions
                .iter()
                .filter_map(|(ch, c)| c.clone().map(|c| (ch.clone(), c)))
                .collect();
            (subscriptions, cursors)
        };
        let frame =
            ServerMessage::Pong { timestamp, server_time: iso_now(), subscriptions, cursors };
        conn.enqueue(serialize_frame(&frame)).is_ok()
    }

    /// Connections whose last heartbeat is older than `timeout`.
    pub async fn dead_connections(&self, timeout: Duration) -> Vec<String> {
        let conns = self.connections.read().await;
        conns
            .values()
            .filter(|c| c.state().last_heartbeat.elapsed() > timeout)
            .map(|c| c.id.clone())
            .collect()
    }

    // -- Direct sends ---------------------------------------------------------

    /// Serialize once and offer the frame to every connection. Returns the
    /// number of successful enqueues.
    pub async fn broadcast(&self, msg: &ServerMessage) -> usize {
        let frame = serialize_frame(msg);
        let conns = self.connections.read().await;
        conns.values().filter(|c| c.enqueue(Arc::clone(&frame)).is_ok()).count()
    }

    pub async fn send_to_connection(&self, conn_id: &str, msg: &ServerMessage) -> bool {
        match self.connection(conn_id).await {
            Some(conn) => conn.enqueue(serialize_frame(msg)).is_ok(),
            None => false,
        }
    }

    // -- Cleanup --------------------------------------------------------------

    /// Physically prune expired entries from every buffer.
    pub async fn prune_buffers(&self) -> usize {
        let buffers: Vec<SharedBuffer> = { self.buffers.read().await.values().cloned().collect() };
        let mut removed = 0;
        for buffer in buffers {
            removed += buffer.lock().await.prune();
        }
        removed
    }

    /// Drop buffers that are empty after pruning and have no subscribers.
    /// Their loss counters are folded into the hub totals first.
    pub async fn prune_unused_buffers(&self) -> usize {
        // Pass 1: prune and note empty buffers.
        let candidates: Vec<String> = {
            let buffers = self.buffers.read().await;
            let mut empty = Vec::new();
            for (channel, buffer) in buffers.iter() {
                let mut buf = buffer.lock().await;
                buf.prune();
                if buf.is_empty() {
                    empty.push(channel.clone());
                }
            }
            empty
        };
        if candidates.is_empty() {
            return 0;
        }

        // Pass 2: keep buffers that still have subscribers.
        let removable: Vec<String> = {
            let subs = self.subscribers.read().await;
            candidates
                .into_iter()
                .filter(|ch| subs.get(ch).is_none_or(HashSet::is_empty))
                .collect()
        };

        // Pass 3: remove, re-checking emptiness under the write lock since a
        // publish may have landed in between.
        let mut removed = 0;
        let mut buffers = self.buffers.write().await;
        for channel in removable {
            let Some(buffer) = buffers.get(&channel) else { continue };
            let counters = {
                let buf = buffer.lock().await;
                if !buf.is_empty() {
                    continue;
                }
                buf.counters()
            };
            buffers.remove(&channel);
            self.fold_retired_counters(Channel::prefix_of(&channel), counters);
            removed += 1;
        }
        removed
    }

    fn fold_retired_counters(&self, prefix: &str, counters: RingCounters) {
        let mut retired = self.retired_loss.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = retired.entry(prefix.to_owned()).or_default();
        entry.capacity_evictions += counters.capacity_evictions;
        entry.ttl_expirations += counters.ttl_expirations;
    }

    // -- Stats ----------------------------------------------------------------

    pub async fn stats(&self) -> HubStats {
        let mut stats =
            HubStats { connections: self.connection_count().await, ..HubStats::default() };

        {
            let rate = self.rate.lock().unwrap_or_else(PoisonError::into_inner);
            stats.messages_published = rate.count;
            let elapsed = rate.since.elapsed().as_secs_f64();
            stats.messages_per_second =
                if elapsed > 0.0 { rate.count as f64 / elapsed } else { 0.0 };
        }

        let mut last_drop_ms = self.last_send_drop_ms.load(Ordering::Relaxed);
        let mut by_prefix: HashMap<String, LossCounters> =
            self.retired_loss.lock().unwrap_or_else(PoisonError::into_inner).clone();

        {
            let buffers = self.buffers.read().await;
            stats.channels = buffers.len();
            let mut utilization: HashMap<String, (f64, usize)> = HashMap::new();
            for (channel, buffer) in buffers.iter() {
                let buf = buffer.lock().await;
                let prefix = Channel::prefix_of(channel).to_owned();
                let counters = buf.counters();
                let entry = by_prefix.entry(prefix.clone()).or_default();
                entry.capacity_evictions += counters.capacity_evictions;
                entry.ttl_expirations += counters.ttl_expirations;
                if let Some(at) = counters.last_eviction_at {
                    last_drop_ms = last_drop_ms.max(at);
                }
                let agg = utilization.entry(prefix).or_insert((0.0, 0));
                agg.0 += buf.utilization();
                agg.1 += 1;
            }
            stats.buffer_utilization_by_prefix = utilization
                .into_iter()
                .map(|(prefix, (sum, n))| (prefix, sum / n as f64))
                .collect();
        }

        {
            let failures =
                self.send_failures_by_prefix.lock().unwrap_or_else(PoisonError::into_inner);
            for (prefix, count) in failures.iter() {
                by_prefix.entry(prefix.clone()).or_default().send_failures += count;
            }
        }

        {
            let subs = self.subscribers.read().await;
            for (channel, set) in subs.iter() {
                *stats
                    .subscriptions_by_prefix
                    .entry(Channel::prefix_of(channel).to_owned())
                    .or_default() += set.len();
            }
        }

        stats.loss = LossStats {
            capacity_evictions: by_prefix.values().map(|c| c.capacity_evictions).sum(),
            ttl_expirations: by_prefix.values().map(|c| c.ttl_expirations).sum(),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            last_drop_at: (last_drop_ms > 0).then(|| iso_from_ms(last_drop_ms)),
            by_prefix,
        };
        stats.expired_cursor_resumes = self.expired_cursor_resumes.load(Ordering::Relaxed);
        stats
    }

    /// Per-channel diagnostics for the listing endpoint.
    pub async fn channel_infos(&self) -> Vec<ChannelInfo> {
        let mut infos = Vec::new();
        {
            let buffers = self.buffers.read().await;
            for (channel, buffer) in buffers.iter() {
                let buf = buffer.lock().await;
                infos.push(ChannelInfo {
                    channel: channel.clone(),
                    subscribers: 0,
                    valid_size: buf.valid_size(),
                    capacity: buf.capacity(),
                    utilization: buf.utilization(),
                    oldest_cursor: buf.oldest_cursor().map(|c| c.encode()),
                    latest_cursor: buf.latest_cursor().map(|c| c.encode()),
                });
            }
        }
        {
            let subs = self.subscribers.read().await;
            for info in &mut infos {
                info.subscribers = subs.get(&info.channel).map_or(0, HashSet::len);
            }
        }
        infos.sort_by(|a, b| a.channel.cmp(&b.channel));
        infos
    }

    /// Reset the message-rate window.
    pub fn reset_message_stats(&self) {
        let mut rate = self.rate.lock().unwrap_or_else(PoisonError::into_inner);
        rate.count = 0;
        rate.since = Instant::now();
    }

    fn record_send_failure(&self, prefix: &str) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        self.last_send_drop_ms.store(epoch_ms(), Ordering::Relaxed);
        let mut by_prefix =
            self.send_failures_by_prefix.lock().unwrap_or_else(PoisonError::into_inner);
        *by_prefix.entry(prefix.to_owned()).or_default() += 1;
    }

    async fn get_or_create_buffer(&self, channel: &Channel) -> SharedBuffer {
        let canonical = channel.canonical();
        if let Some(buffer) = self.buffers.read().await.get(&canonical) {
            return Arc::clone(buffer);
        }
        let mut buffers = self.buffers.write().await;
        Arc::clone(buffers.entry(canonical).or_insert_with(|| {
            Arc::new(Mutex::new(RingBuffer::new(retention_for(&channel.prefix()))))
        }))
    }
}

/// Serialize a server frame once for sharing across subscribers. A failure
/// substitutes a synthetic `SERIALIZATION_ERROR` frame instead of tearing
/// down the connection.
fn serialize_frame(msg: &ServerMessage) -> Arc<str> {
    match serde_json::to_string(msg) {
        Ok(json) => Arc::from(json),
        Err(e) => {
            tracing::warn!(err = %e, "server frame serialization failed");
            let fallback =
                ServerMessage::error(ErrorCode::Serialization, "event could not be serialized");
            match serde_json::to_string(&fallback) {
                Ok(json) => Arc::from(json),
                Err(_) => Arc::from(
                    r#"{"type":"error","code":"SERIALIZATION_ERROR","message":"event could not be serialized"}"#,
                ),
            }
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
