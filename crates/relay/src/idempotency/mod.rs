// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idempotent replay cache for mutating HTTP requests.
//!
//! Responses are memoized per client-supplied `Idempotency-Key` and replayed
//! byte-for-byte. Concurrent duplicates coalesce onto a single in-flight
//! execution (single-flight); replays with a different request fingerprint
//! are rejected. Eviction relies on the store's insertion order: expired
//! records go first, then the oldest entries beyond the record bound.

pub mod layer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::message::epoch_ms;

/// Valid `Idempotency-Key` header length range.
pub const KEY_LENGTH_RANGE: std::ops::RangeInclusive<usize> = 8..=256;

/// Cache tunables.
#[derive(Debug, Clone)]
pub struct IdempotencySettings {
    pub ttl: Duration,
    pub max_records: usize,
    /// Methods gated by the middleware.
    pub methods: Vec<Method>,
    /// Path prefixes that bypass the middleware entirely.
    pub exclude_paths: Vec<String>,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(86_400_000),
            max_records: 10_000,
            methods: vec![Method::POST, Method::PUT, Method::PATCH],
            exclude_paths: vec!["/api/v1/health".to_owned()],
        }
    }
}

/// A memoized response.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Cached headers, lowercase names. Restricted to `Content-Type` and
    /// `X-*` (minus `X-Idempotent-*`).
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub fingerprint: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl IdempotencyRecord {
    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Progress of the in-flight leader, observed by coalesced waiters.
#[derive(Debug, Clone, Default)]
pub enum PendingOutcome {
    #[default]
    Pending,
    /// Leader produced a cacheable response; replay it.
    Resolved(Arc<IdempotencyRecord>),
    /// Leader failed or produced an uncacheable response; retry as fresh.
    Rejected,
}

struct PendingRequest {
    fingerprint: String,
    rx: watch::Receiver<PendingOutcome>,
}

/// Entry decision for one keyed request.
pub enum Admission {
    /// Cached response available; replay it.
    Replay(Arc<IdempotencyRecord>),
    /// Key re-used with a different fingerprint.
    Mismatch,
    /// Same request already in flight; wait for its outcome.
    Wait(watch::Receiver<PendingOutcome>),
    /// Caller is the leader and must execute downstream.
    Lead(PendingGuard),
}

/// Shared idempotency cache. The store and the pending map are each behind
/// their own lock; waiters synchronize only through the watch channel.
pub struct IdempotencyState {
    settings: IdempotencySettings,
    store: Mutex<IndexMap<String, Arc<IdempotencyRecord>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl IdempotencyState {
    pub fn new(settings: IdempotencySettings) -> Self {
        Self { settings, store: Mutex::new(IndexMap::new()), pending: Mutex::new(HashMap::new()) }
    }

    pub fn settings(&self) -> &IdempotencySettings {
        &self.settings
    }

    /// Whether the middleware applies to this method/path at all.
    pub fn applies_to(&self, method: &Method, path: &str) -> bool {
        self.settings.methods.contains(method)
            && !self.settings.exclude_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Decide how to admit a keyed request. See the decision table in the
    /// middleware; expired records are dropped on access.
    pub fn admit(self: &Arc<Self>, key: &str, fingerprint: &str) -> Admission {
        let now = epoch_ms();
        {
            let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = store.get(key) {
                if record.expired(now) {
                    store.shift_remove(key);
                } else if record.fingerprint == fingerprint {
                    return Admission::Replay(Arc::clone(record));
                } else {
                    return Admission::Mismatch;
                }
            }
        }

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = pending.get(key) {
            if entry.fingerprint == fingerprint {
                Admission::Wait(entry.rx.clone())
            } else {
                Admission::Mismatch
            }
        } else {
            let (tx, rx) = watch::channel(PendingOutcome::Pending);
            pending.insert(
                key.to_owned(),
                PendingRequest { fingerprint: fingerprint.to_owned(), rx },
            );
            Admission::Lead(PendingGuard {
                state: Arc::clone(self),
                key: key.to_owned(),
                tx,
                sent: false,
            })
        }
    }

    /// Insert a freshly produced record.
    pub fn store_record(&self, record: Arc<IdempotencyRecord>) {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        store.insert(record.key.clone(), record);
    }

    /// Prune expired records, then evict oldest-first down to the bound.
    /// Returns `(expired, evicted)`.
    pub fn sweep(&self) -> (usize, usize) {
        let now = epoch_ms();
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let expired_keys: Vec<String> =
            store.iter().filter(|(_, r)| r.expired(now)).map(|(k, _)| k.clone()).collect();
        for key in &expired_keys {
            store.shift_remove(key);
        }
        let mut evicted = 0;
        while store.len() > self.settings.max_records {
            store.shift_remove_index(0);
            evicted += 1;
        }
        if !expired_keys.is_empty() || evicted > 0 {
            tracing::debug!(expired = expired_keys.len(), evicted, "idempotency sweep");
        }
        (expired_keys.len(), evicted)
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached record. Pending entries are untouched.
    pub fn clear(&self) {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn remove_pending(&self, key: &str) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Leader-side handle for a pending entry. Whatever happens to the leader,
/// dropping the guard removes the pending entry and unblocks waiters.
pub struct PendingGuard {
    state: Arc<IdempotencyState>,
    key: String,
    tx: watch::Sender<PendingOutcome>,
    sent: bool,
}

impl PendingGuard {
    /// Publish the record to coalesced waiters.
    pub fn resolve(mut self, record: Arc<IdempotencyRecord>) {
        let _ = self.tx.send(PendingOutcome::Resolved(record));
        self.sent = true;
    }

    /// Tell waiters to retry as fresh requests.
    pub fn reject(mut self) {
        let _ = self.tx.send(PendingOutcome::Rejected);
        self.sent = true;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.state.remove_pending(&self.key);
        if !self.sent {
            let _ = self.tx.send(PendingOutcome::Rejected);
        }
    }
}

/// First 16 hex chars of `SHA-256(method ":" path ":" body)`.
pub fn fingerprint(method: &Method, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(body);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Spawn the periodic sweep loop.
pub fn spawn_sweeper(
    state: Arc<IdempotencyState>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            state.sweep();
        }
    })
}

#[cfg(test)]
#[path = "idempotency_tests.rs"]
mod tests;
