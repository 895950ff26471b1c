// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hub telemetry snapshot types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Event-loss counters, aggregate or per channel prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossCounters {
    pub capacity_evictions: u64,
    pub ttl_expirations: u64,
    pub send_failures: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossStats {
    pub capacity_evictions: u64,
    pub ttl_expirations: u64,
    pub send_failures: u64,
    /// ISO-8601 time of the most recent drop of any kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_drop_at: Option<String>,
    pub by_prefix: HashMap<String, LossCounters>,
}

/// Point-in-time hub diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: usize,
    pub channels: usize,
    /// Active subscriptions bucketed by channel prefix.
    pub subscriptions_by_prefix: HashMap<String, usize>,
    /// Messages published since the last stats reset.
    pub messages_published: u64,
    pub messages_per_second: f64,
    /// Mean buffer utilization bucketed by channel prefix.
    pub buffer_utilization_by_prefix: HashMap<String, f64>,
    /// Resumes (subscribe/replay) whose cursor no longer resolved.
    pub expired_cursor_resumes: u64,
    pub loss: LossStats,
}

/// Per-channel diagnostics for the channel listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel: String,
    pub subscribers: usize,
    pub valid_size: usize,
    pub capacity: usize,
    pub utilization: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_cursor: Option<String>,
}
