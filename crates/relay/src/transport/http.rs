// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Axum handlers for the downstream HTTP surface (§6):
//! `POST /v1/messages`, `GET /v1/key-info`, `GET /health`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::RelayError;
use crate::orchestrator::{RelayOrchestrator, RelayOutcome, RelayRequest};
use crate::transport::auth::extract_api_key;
use crate::util::epoch_ms;

pub struct AppState {
    pub orchestrator: Arc<RelayOrchestrator>,
    pub started_at: u64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime_ms = epoch_ms().saturating_sub(state.started_at);
    let stats = state.orchestrator.cache_stats();
    Json(json!({
        "status": "ok",
        "uptime_ms": uptime_ms,
        "cache": {
            "key_cache": {"hits": stats.key_cache.0, "misses": stats.key_cache.1},
            "dedup_cache": {"hits": stats.dedup_cache.0, "misses": stats.dedup_cache.1},
            "account_list_cache": {"hits": stats.account_list_cache.0, "misses": stats.account_list_cache.1},
        },
    }))
}

pub async fn key_info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RelayError> {
    let key_id = extract_api_key(&headers).ok_or(RelayError::KeyNotFound)?;
    let key = state.orchestrator.resolve_key(&key_id).await?;
    Ok(Json(json!({
        "persona": key.persona,
        "display_name": key.display_name,
        "model_restriction_enabled": key.enable_model_restriction,
    })))
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}

pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, RelayError> {
    let key_id = extract_api_key(&headers).ok_or(RelayError::KeyNotFound)?;
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| RelayError::BodyShapeInvalid(format!("request body not JSON: {e}")))?;
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let downstream_headers = header_pairs(&headers);

    let relay_req = RelayRequest {
        key_id: &key_id,
        user_agent: &user_agent,
        downstream_headers: &downstream_headers,
        body,
        stream,
    };

    match state.orchestrator.handle(relay_req).await? {
        RelayOutcome::Buffered { status, headers, body } => {
            let mut resp = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            for (k, v) in headers {
                if let (Ok(name), Ok(value)) = (
                    axum::http::HeaderName::from_bytes(k.as_bytes()),
                    HeaderValue::from_str(&v),
                ) {
                    resp = resp.header(name, value);
                }
            }
            Ok(resp.body(Body::from(body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
        }
        RelayOutcome::Streaming { headers, body } => {
            let mut resp = Response::builder().status(StatusCode::OK);
            for (k, v) in headers {
                if let (Ok(name), Ok(value)) = (
                    axum::http::HeaderName::from_bytes(k.as_bytes()),
                    HeaderValue::from_str(&v),
                ) {
                    resp = resp.header(name, value);
                }
            }
            let stream = body.map(|r| r.map_err(std::io::Error::other));
            Ok(resp
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
        }
    }
}
