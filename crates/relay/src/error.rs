// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Relay error taxonomy and its mapping onto downstream HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("kv store unavailable: {0}")]
    KvUnavailable(String),

    #[error("api key not found")]
    KeyNotFound,

    #[error("model not permitted for this key")]
    KeyForbiddenModel,

    #[error("client identity not permitted for this key")]
    KeyForbiddenClient,

    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("upstream transport error: {0}")]
    UpstreamTransport(UpstreamTransportKind),

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("upstream rate limited")]
    UpstreamRateLimited { status: u16, body: String },

    #[error("input token floor not met: {current} < {minimum}")]
    TokenFloorNotMet { current: u64, minimum: u64 },

    #[error("request body does not match the expected shape: {0}")]
    BodyShapeInvalid(String),

    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransportKind {
    Reset,
    Dns,
    Refused,
    Timeout,
    Other,
}

impl std::fmt::Display for UpstreamTransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpstreamTransportKind::Reset => "reset",
            UpstreamTransportKind::Dns => "dns",
            UpstreamTransportKind::Refused => "refused",
            UpstreamTransportKind::Timeout => "timeout",
            UpstreamTransportKind::Other => "other",
        };
        f.write_str(s)
    }
}

impl RelayError {
    /// Errors the orchestrator may retry with backoff (§7: base 1s, factor 2, cap 3 attempts).
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            RelayError::KvUnavailable(_) | RelayError::UpstreamTransport(_)
        )
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            RelayError::KeyNotFound => StatusCode::UNAUTHORIZED,
            RelayError::KeyForbiddenModel | RelayError::KeyForbiddenClient => {
                StatusCode::FORBIDDEN
            }
            RelayError::TokenFloorNotMet { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::TokenRefreshFailed(_) => StatusCode::BAD_GATEWAY,
            RelayError::UpstreamRateLimited { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::TOO_MANY_REQUESTS)
            }
            RelayError::UpstreamStatus(code) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::BodyShapeInvalid(_) => StatusCode::BAD_REQUEST,
            RelayError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Config(_)
            | RelayError::Crypto(_)
            | RelayError::KvUnavailable(_)
            | RelayError::UpstreamTransport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ForbiddenBody {
    error: ForbiddenError,
}

#[derive(Serialize)]
struct ForbiddenError {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

#[derive(Serialize)]
struct TokenFloorBody {
    error: &'static str,
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    current_tokens: u64,
    minimum_tokens: u64,
    retry_after: u64,
}

#[derive(Serialize)]
struct GenericErrorBody {
    error: String,
    #[serde(rename = "requestId")]
    request_id: String,
    timestamp: u64,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        // §7: Cancelled is silent — the downstream socket is already gone.
        if matches!(self, RelayError::Cancelled) {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        let status = self.http_status();

        match &self {
            RelayError::KeyForbiddenModel | RelayError::KeyForbiddenClient => (
                status,
                Json(ForbiddenBody {
                    error: ForbiddenError {
                        kind: "forbidden",
                        message: self.to_string(),
                    },
                }),
            )
                .into_response(),
            RelayError::TokenFloorNotMet { current, minimum } => {
                let body = TokenFloorBody {
                    error: "Too Few Tokens",
                    message: self.to_string(),
                    kind: "token_limit_error",
                    current_tokens: *current,
                    minimum_tokens: *minimum,
                    retry_after: 60,
                };
                let mut resp = (status, Json(body)).into_response();
                if let Ok(v) = axum::http::HeaderValue::from_str("60") {
                    resp.headers_mut().insert("Retry-After", v);
                }
                if let Ok(v) = axum::http::HeaderValue::from_str("token_limit_error") {
                    resp.headers_mut().insert("X-Error-Type", v);
                }
                resp
            }
            RelayError::UpstreamRateLimited { status: code, body } => {
                let status = StatusCode::from_u16(*code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
                (status, body.clone()).into_response()
            }
            _ => {
                tracing::error!(error = %self, "relay request failed");
                let body = GenericErrorBody {
                    error: self.to_string(),
                    request_id: uuid::Uuid::new_v4().to_string(),
                    timestamp: crate::util::epoch_ms(),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}
