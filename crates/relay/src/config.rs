// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the relay gateway.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "relay", about = "Real-time fan-out gateway for agent orchestration")]
pub struct GatewayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "RELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9600, env = "RELAY_PORT")]
    pub port: u16,

    /// Server heartbeat broadcast cadence in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "RELAY_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: u64,

    /// Close connections whose last heartbeat is older than this (ms).
    #[arg(long, default_value_t = 90_000, env = "RELAY_CONNECTION_TIMEOUT_MS")]
    pub connection_timeout_ms: u64,

    /// Idempotency record TTL in milliseconds.
    #[arg(long, default_value_t = 86_400_000, env = "RELAY_IDEMPOTENCY_TTL_MS")]
    pub idempotency_ttl_ms: u64,

    /// Idempotency cache bound; oldest records are evicted beyond it.
    #[arg(long, default_value_t = 10_000, env = "RELAY_IDEMPOTENCY_MAX_RECORDS")]
    pub idempotency_max_records: usize,

    /// Shutdown drain budget in seconds, clamped to [1, 300].
    #[arg(long, default_value_t = 30, env = "RELAY_DRAIN_DEADLINE_SECONDS")]
    pub drain_deadline_seconds: u64,

    /// Cadence of the idempotency sweep and buffer pruning (ms).
    #[arg(long, default_value_t = 60_000, env = "RELAY_CLEANUP_INTERVAL_MS")]
    pub cleanup_interval_ms: u64,
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}
