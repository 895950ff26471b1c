// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Axum middleware applying the idempotency cache to mutating requests.
//!
//! The request body is fully buffered so the fingerprint covers the exact
//! bytes the handler will see; the rebuilt request carries the buffered
//! body with `Content-Length` set and any transfer encodings stripped.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Response as HttpResponse, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::{fingerprint, Admission, IdempotencyRecord, IdempotencyState, PendingOutcome, KEY_LENGTH_RANGE};
use crate::error::ErrorCode;
use crate::message::epoch_ms;

/// Replayed responses carry this header.
pub const REPLAYED_HEADER: &str = "x-idempotent-replayed";

pub async fn idempotency_layer(
    State(state): State<Arc<IdempotencyState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.applies_to(req.method(), req.uri().path()) {
        return next.run(req).await;
    }
    let Some(raw_key) = req.headers().get("idempotency-key") else {
        return next.run(req).await;
    };
    let key = match raw_key.to_str() {
        Ok(k) if KEY_LENGTH_RANGE.contains(&k.len()) => k.to_owned(),
        _ => {
            return ErrorCode::InvalidIdempotencyKey
                .to_http_response(format!(
                    "Idempotency-Key must be {}..{} characters",
                    KEY_LENGTH_RANGE.start(),
                    KEY_LENGTH_RANGE.end()
                ))
                .into_response()
        }
    };

    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(err = %e, "failed to buffer request body");
            return ErrorCode::InvalidFormat
                .to_http_response("request body could not be read")
                .into_response();
        }
    };
    let path = parts.uri.path().to_owned();
    let fp = fingerprint(&parts.method, &path, &bytes);

    // Downstream sees the buffered bytes: fix the length, drop encodings.
    parts.headers.remove(header::CONTENT_ENCODING);
    parts.headers.remove(header::TRANSFER_ENCODING);
    parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));

    loop {
        match state.admit(&key, &fp) {
            Admission::Replay(record) => return replay_response(&record),
            Admission::Mismatch => {
                return ErrorCode::IdempotencyKeyMismatch
                    .to_http_response("idempotency key was re-used with a different request")
                    .into_response()
            }
            Admission::Wait(mut rx) => {
                loop {
                    let outcome = rx.borrow_and_update().clone();
                    match outcome {
                        PendingOutcome::Resolved(record) => return replay_response(&record),
                        PendingOutcome::Rejected => break,
                        PendingOutcome::Pending => {
                            if rx.changed().await.is_err() {
                                break;
                            }
                        }
                    }
                }
                // Leader failed; retry this request as fresh.
                continue;
            }
            Admission::Lead(guard) => {
                let method = parts.method.as_str().to_owned();
                let req = Request::from_parts(parts, Body::from(bytes.clone()));
                let resp = next.run(req).await;
                let (resp_parts, resp_body) = resp.into_parts();
                let resp_bytes = match axum::body::to_bytes(resp_body, usize::MAX).await {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::error!(err = %e, "failed to buffer response body");
                        guard.reject();
                        return ErrorCode::Internal
                            .to_http_response("response could not be buffered")
                            .into_response();
                    }
                };

                let status = resp_parts.status.as_u16();
                if cacheable(status) {
                    let now = epoch_ms();
                    let record = Arc::new(IdempotencyRecord {
                        key: key.clone(),
                        method,
                        path,
                        status,
                        headers: cacheable_headers(&resp_parts.headers),
                        body: resp_bytes.clone(),
                        fingerprint: fp,
                        created_at_ms: now,
                        expires_at_ms: now + state.settings().ttl.as_millis() as u64,
                    });
                    state.store_record(Arc::clone(&record));
                    guard.resolve(record);
                } else {
                    guard.reject();
                }
                return HttpResponse::from_parts(resp_parts, Body::from(resp_bytes));
            }
        }
    }
}

/// Only successful and client-error responses are memoized; 3xx and 5xx
/// pass through uncached.
fn cacheable(status: u16) -> bool {
    (200..300).contains(&status) || (400..500).contains(&status)
}

/// Headers worth replaying: `Content-Type` plus `X-*`, excluding our own
/// `X-Idempotent-*` markers.
fn cacheable_headers(headers: &axum::http::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            let keep = name == "content-type"
                || (name.starts_with("x-") && !name.starts_with("x-idempotent-"));
            if !keep {
                return None;
            }
            value.to_str().ok().map(|v| (name, v.to_owned()))
        })
        .collect()
}

/// Rebuild a cached response, marking it replayed.
fn replay_response(record: &IdempotencyRecord) -> Response {
    let mut builder = HttpResponse::builder()
        .status(StatusCode::from_u16(record.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in &record.headers {
        if name.starts_with("x-idempotent-") {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(REPLAYED_HEADER, "true");
    match builder.body(Body::from(Bytes::clone(&record.body))) {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(err = %e, "failed to rebuild cached response");
            ErrorCode::Internal.to_http_response("cached response was invalid").into_response()
        }
    }
}
