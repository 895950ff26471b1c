// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket frame types for the gateway real-time protocol.
//!
//! Frames are internally-tagged JSON objects (`{"type": "subscribe", ...}`)
//! with camelCase field names. Two top-level enums cover client-to-server
//! and server-to-client directions. Parsing is strict: anything that does
//! not deserialize into [`ClientMessage`] is answered with an
//! `INVALID_FORMAT` error frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Severity};
use crate::message::HubMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        channel: String,
        #[serde(default)]
        cursor: Option<String>,
    },
    Unsubscribe {
        channel: String,
    },
    Backfill {
        channel: String,
        from_cursor: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    Ping {
        timestamp: u64,
    },
    Reconnect {
        cursors: HashMap<String, String>,
    },
    Ack {
        message_ids: Vec<String>,
    },
}

/// Feature flags advertised in the `connected` frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub backfill: bool,
    pub compression: bool,
    pub acknowledgment: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { backfill: true, compression: false, acknowledgment: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        connection_id: String,
        server_time: String,
        server_version: String,
        capabilities: Capabilities,
        heartbeat_interval_ms: u64,
    },
    Subscribed {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    Unsubscribed {
        channel: String,
    },
    Message {
        message: HubMessage,
        #[serde(skip_serializing_if = "Option::is_none")]
        ack_required: Option<bool>,
    },
    BackfillResponse {
        channel: String,
        messages: Vec<HubMessage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_cursor: Option<String>,
        has_more: bool,
    },
    Pong {
        timestamp: u64,
        server_time: String,
        subscriptions: Vec<String>,
        cursors: HashMap<String, String>,
    },
    Heartbeat {
        server_time: String,
    },
    ReconnectAck {
        replayed: HashMap<String, usize>,
        expired: Vec<String>,
        new_cursors: HashMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_acks_replayed: Option<usize>,
    },
    AckResponse {
        acknowledged: Vec<String>,
        not_found: Vec<String>,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        severity: Option<Severity>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    Throttled {
        message: String,
        resume_after_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_count: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
}

impl ServerMessage {
    /// A message frame, flagging `ackRequired` only when set.
    pub fn message(message: HubMessage, ack_required: bool) -> Self {
        Self::Message { message, ack_required: ack_required.then_some(true) }
    }

    /// An error frame with the code's default severity.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_str().to_owned(),
            message: message.into(),
            channel: None,
            severity: Some(code.severity()),
            hint: None,
            details: None,
        }
    }

    /// An error frame scoped to a channel.
    pub fn channel_error(code: ErrorCode, message: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_str().to_owned(),
            message: message.into(),
            channel: Some(channel.into()),
            severity: Some(code.severity()),
            hint: None,
            details: None,
        }
    }
}

#[cfg(test)]
#[path = "ws_msg_tests.rs"]
mod tests;
