// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Downstream API-key extraction. Bearer key in `authorization` (or
//! `x-api-key`); each request carries its own per-tenant key which is
//! resolved against the `KeyStore` inside the orchestrator, not validated
//! here.

use axum::http::HeaderMap;

pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
