// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hub message and cursor types.
//!
//! A [`HubMessage`] is the immutable unit of fan-out: producers build one per
//! event, the channel's ring buffer assigns it a [`Cursor`], and subscribers
//! receive read-only copies. Cursors are opaque strings on the wire; within a
//! single channel they order strictly by sequence.

use std::fmt;

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current wall-clock time as ISO-8601 UTC with millisecond precision.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format an epoch-millis timestamp as ISO-8601 UTC with millisecond precision.
pub fn iso_from_ms(ms: u64) -> String {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Position marker inside one channel's ring buffer.
///
/// Encodes `(sequence, timestamp_ms)`. The sequence is zero-padded hex so the
/// encoded form sorts lexicographically in sequence order within a channel.
/// Clients treat the string as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub seq: u64,
    pub ts_ms: u64,
}

impl Cursor {
    pub fn new(seq: u64, ts_ms: u64) -> Self {
        Self { seq, ts_ms }
    }

    pub fn encode(&self) -> String {
        format!("{:016x}.{:x}", self.seq, self.ts_ms)
    }

    /// Decode an encoded cursor. Returns `None` for anything malformed; a
    /// cursor that fails to decode is treated as absent by all callers.
    pub fn decode(s: &str) -> Option<Self> {
        let (seq, ts) = s.split_once('.')?;
        if seq.len() != 16 {
            return None;
        }
        let seq = u64::from_str_radix(seq, 16).ok()?;
        let ts_ms = u64::from_str_radix(ts, 16).ok()?;
        Some(Self { seq, ts_ms })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Producer-supplied correlation metadata, passed through verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl MessageMeta {
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.agent_id.is_none()
            && self.user_id.is_none()
            && self.workspace_id.is_none()
    }
}

/// One event as stored in a channel buffer and delivered to subscribers.
///
/// `payload` is an opaque JSON value chosen by the producer and serialized
/// verbatim; validation lives with producers, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubMessage {
    /// Globally unique, opaque message id.
    pub id: String,
    /// Encoded [`Cursor`], assigned on buffer insertion.
    pub cursor: String,
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub timestamp: String,
    /// Canonical channel string.
    pub channel: String,
    /// Producer-chosen event kind, e.g. `output.chunk`.
    pub r#type: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMeta>,
}

impl HubMessage {
    /// Build a message with a fresh id and current timestamp. The cursor is
    /// filled in when the channel buffer accepts the message.
    pub fn new(
        channel: String,
        r#type: String,
        payload: serde_json::Value,
        metadata: Option<MessageMeta>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cursor: String::new(),
            timestamp: iso_now(),
            channel,
            r#type,
            payload,
            metadata: metadata.filter(|m| !m.is_empty()),
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
