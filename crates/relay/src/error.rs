// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error codes shared across the HTTP and WebSocket surfaces.

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidFormat,
    InvalidChannel,
    InvalidIdempotencyKey,
    IdempotencyKeyMismatch,
    SubscriptionDenied,
    AuthenticationRequired,
    CursorExpired,
    RateLimited,
    Draining,
    MaintenanceMode,
    Internal,
    Serialization,
}

/// How a client should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Do not retry; the connection or request is unrecoverable.
    Terminal,
    /// Fix the request and try again.
    Recoverable,
    /// Back off and retry the same request.
    Retry,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::InvalidChannel => "INVALID_CHANNEL",
            Self::InvalidIdempotencyKey => "INVALID_IDEMPOTENCY_KEY",
            Self::IdempotencyKeyMismatch => "IDEMPOTENCY_KEY_MISMATCH",
            Self::SubscriptionDenied => "WS_SUBSCRIPTION_DENIED",
            Self::AuthenticationRequired => "WS_AUTHENTICATION_REQUIRED",
            Self::CursorExpired => "WS_CURSOR_EXPIRED",
            Self::RateLimited => "WS_RATE_LIMITED",
            Self::Draining => "DRAINING",
            Self::MaintenanceMode => "MAINTENANCE_MODE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidFormat => 400,
            Self::InvalidChannel => 400,
            Self::InvalidIdempotencyKey => 400,
            Self::IdempotencyKeyMismatch => 422,
            Self::SubscriptionDenied => 403,
            Self::AuthenticationRequired => 401,
            Self::CursorExpired => 410,
            Self::RateLimited => 429,
            Self::Draining => 503,
            Self::MaintenanceMode => 503,
            Self::Internal => 500,
            Self::Serialization => 500,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::InvalidFormat
            | Self::InvalidChannel
            | Self::InvalidIdempotencyKey
            | Self::IdempotencyKeyMismatch
            | Self::AuthenticationRequired
            | Self::CursorExpired => Severity::Recoverable,
            Self::SubscriptionDenied => Severity::Terminal,
            Self::RateLimited
            | Self::Draining
            | Self::MaintenanceMode
            | Self::Internal
            | Self::Serialization => Severity::Retry,
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody {
            code: self.as_str().to_owned(),
            message: message.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: crate::message::iso_now(),
            severity: Some(self.severity()),
            hint: None,
            details: None,
        }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub correlation_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
