// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Instant;

use crate::config::GatewayConfig;
use crate::hub::Hub;
use crate::idempotency::IdempotencyState;
use crate::maintenance::MaintenanceState;

/// Shared application state passed to all handlers via axum `State`.
///
/// Each subsystem is an explicit owned handle created at startup and stopped
/// in reverse order at shutdown; nothing here is a process global.
pub struct GatewayState {
    pub hub: Arc<Hub>,
    pub idempotency: Arc<IdempotencyState>,
    pub maintenance: Arc<MaintenanceState>,
    pub config: GatewayConfig,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        hub: Arc<Hub>,
        idempotency: Arc<IdempotencyState>,
        maintenance: Arc<MaintenanceState>,
    ) -> Self {
        Self { hub, idempotency, maintenance, config, started_at: Instant::now() }
    }
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish()
    }
}
