// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide lifecycle gate: maintenance mode, graceful drain, and
//! in-flight request accounting.
//!
//! While draining or in maintenance, mutating HTTP on non-allow-listed
//! paths is refused with 503; reads continue. The in-flight counter is
//! maintained by an RAII guard so it stays symmetric no matter how a
//! handler exits.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::message::{epoch_ms, iso_from_ms};

/// Paths that bypass the mutating-traffic gate.
pub const DEFAULT_ALLOW_PREFIXES: &[&str] = &["/api/v1/health", "/api/v1/maintenance"];

/// Drain deadlines are clamped to this range (seconds).
pub const DRAIN_DEADLINE_RANGE: std::ops::RangeInclusive<u64> = 1..=300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Running,
    Maintenance,
    Draining,
}

#[derive(Debug)]
struct Inner {
    mode: Mode,
    reason: Option<String>,
    deadline: Option<Instant>,
    deadline_epoch_ms: Option<u64>,
}

/// Serializable view of the controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSnapshot {
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub inflight_requests: i64,
}

/// Process-wide drain/maintenance controller. One handle is created at
/// startup and shared; there is no global.
pub struct MaintenanceState {
    inner: Mutex<Inner>,
    inflight: AtomicI64,
    allow_prefixes: Vec<String>,
}

impl Default for MaintenanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceState {
    pub fn new() -> Self {
        Self::with_allow_prefixes(DEFAULT_ALLOW_PREFIXES.iter().map(|s| (*s).to_owned()))
    }

    pub fn with_allow_prefixes(prefixes: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Running,
                reason: None,
                deadline: None,
                deadline_epoch_ms: None,
            }),
            inflight: AtomicI64::new(0),
            allow_prefixes: prefixes.into_iter().collect(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    pub fn is_draining(&self) -> bool {
        self.mode() == Mode::Draining
    }

    /// Enter maintenance mode. Mutating traffic is refused until `resume`.
    pub fn start_maintenance(&self, reason: Option<String>) {
        let mut inner = self.lock();
        inner.mode = Mode::Maintenance;
        inner.reason = reason;
        inner.deadline = None;
        inner.deadline_epoch_ms = None;
        tracing::info!(reason = inner.reason.as_deref().unwrap_or(""), "entering maintenance mode");
    }

    /// Leave maintenance mode. Draining is one-way; resuming from it fails.
    pub fn resume(&self) -> Result<(), ErrorCode> {
        let mut inner = self.lock();
        match inner.mode {
            Mode::Draining => Err(ErrorCode::Draining),
            _ => {
                inner.mode = Mode::Running;
                inner.reason = None;
                inner.deadline = None;
                inner.deadline_epoch_ms = None;
                tracing::info!("resumed normal operation");
                Ok(())
            }
        }
    }

    /// Begin draining with a bounded deadline. The deadline is clamped to
    /// [1, 300] seconds. Returns the effective deadline.
    pub fn start_draining(&self, deadline_seconds: u64, reason: Option<String>) -> Duration {
        let secs = deadline_seconds
            .clamp(*DRAIN_DEADLINE_RANGE.start(), *DRAIN_DEADLINE_RANGE.end());
        let deadline = Duration::from_secs(secs);
        let mut inner = self.lock();
        inner.mode = Mode::Draining;
        inner.reason = reason;
        inner.deadline = Some(Instant::now() + deadline);
        inner.deadline_epoch_ms = Some(epoch_ms() + secs * 1_000);
        tracing::info!(
            deadline_secs = secs,
            reason = inner.reason.as_deref().unwrap_or(""),
            "draining"
        );
        deadline
    }

    /// Seconds until the drain deadline, rounded up. Absent outside draining.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let inner = self.lock();
        let deadline = inner.deadline?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        Some(remaining.as_secs_f64().ceil() as u64)
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Track one in-flight request for the guard's lifetime.
    pub fn inflight_guard(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard { state: Arc::clone(self) }
    }

    pub fn snapshot(&self) -> MaintenanceSnapshot {
        let inner = self.lock();
        MaintenanceSnapshot {
            mode: inner.mode,
            reason: inner.reason.clone(),
            deadline_at: inner.deadline_epoch_ms.map(iso_from_ms),
            retry_after_secs: inner.deadline.map(|d| {
                d.saturating_duration_since(Instant::now()).as_secs_f64().ceil() as u64
            }),
            inflight_requests: self.inflight(),
        }
    }

    /// Wait until no requests are in flight or the deadline passes, polling
    /// at 100 ms granularity. Returns true when fully drained.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;
        loop {
            if self.inflight() == 0 {
                return true;
            }
            if Instant::now() >= until {
                tracing::warn!(inflight = self.inflight(), "drain deadline reached");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn gate_error(&self) -> Option<ErrorCode> {
        match self.lock().mode {
            Mode::Running => None,
            Mode::Maintenance => Some(ErrorCode::MaintenanceMode),
            Mode::Draining => Some(ErrorCode::Draining),
        }
    }

    fn allows(&self, path: &str) -> bool {
        self.allow_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// RAII in-flight marker; decrements on drop under every exit path.
pub struct InflightGuard {
    state: Arc<MaintenanceState>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.state.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Whether the method mutates state for gating purposes.
pub fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Axum middleware enforcing the lifecycle gate and in-flight accounting.
pub async fn maintenance_layer(
    State(state): State<Arc<MaintenanceState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();

    if is_mutating(req.method()) && !state.allows(path) {
        if let Some(code) = state.gate_error() {
            let (status, body) = code.to_http_response("mutating requests are refused");
            let mut resp = (status, body).into_response();
            if let Some(secs) = state.retry_after_secs() {
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    resp.headers_mut().insert("retry-after", value);
                }
            }
            return resp;
        }
    }

    let _guard = state.inflight_guard();
    next.run(req).await
}

#[cfg(test)]
#[path = "maintenance_tests.rs"]
mod tests;
