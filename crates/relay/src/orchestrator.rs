// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Relay orchestrator (C12): policy checks → select → refresh → count →
//! dispatch → shape → record.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use crate::cache::{CacheStats, RelayCache};
use crate::config::{PersonaConfig, UpstreamConfig};
use crate::error::RelayError;
use crate::header_capture::HeaderCapture;
use crate::model::{AccountStore, ApiKeyRecord, KeyStore, Persona, UsageEvent, UsageSink};
use crate::registry::AccountRegistry;
use crate::refresher::TokenRefresher;
use crate::selector::{session_hash, Selector};
use crate::shaper::request::{shape_request, ShapeOptions};
use crate::shaper::response::{shape_response_body, shape_sse_line, synthesize_headers, ResponseShapeConfig};
use crate::shaper::is_genuine_claude_code;
use crate::token_counter::TokenCounter;
use crate::upstream::client::{StreamOutcome, UpstreamClient, UpstreamRequest};
use crate::util::epoch_ms;

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP_ATTEMPTS: u32 = 3;

pub enum RelayOutcome {
    Buffered {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    Streaming {
        headers: Vec<(String, String)>,
        body: ReceiverStream<Result<Bytes, RelayError>>,
    },
}

pub struct RelayRequest<'a> {
    pub key_id: &'a str,
    pub user_agent: &'a str,
    pub downstream_headers: &'a [(String, String)],
    pub body: Value,
    pub stream: bool,
}

pub struct RelayOrchestrator {
    keys: Arc<dyn KeyStore>,
    accounts: Arc<dyn AccountStore>,
    usage: Arc<dyn UsageSink>,
    cache: Arc<RelayCache>,
    registry: Arc<AccountRegistry>,
    refresher: Arc<TokenRefresher>,
    selector: Selector,
    token_counter: TokenCounter,
    header_capture: HeaderCapture,
    upstream: UpstreamClient,
    upstream_cfg: UpstreamConfig,
    persona_cfg: PersonaConfig,
    dedup_enabled: bool,
}

impl RelayOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Arc<dyn KeyStore>,
        accounts: Arc<dyn AccountStore>,
        usage: Arc<dyn UsageSink>,
        cache: Arc<RelayCache>,
        registry: Arc<AccountRegistry>,
        refresher: Arc<TokenRefresher>,
        token_counter: TokenCounter,
        header_capture: HeaderCapture,
        upstream: UpstreamClient,
        upstream_cfg: UpstreamConfig,
        persona_cfg: PersonaConfig,
        dedup_enabled: bool,
    ) -> Self {
        let selector = Selector::new(registry.clone());
        Self {
            keys,
            accounts,
            usage,
            cache,
            registry,
            refresher,
            selector,
            token_counter,
            header_capture,
            upstream,
            upstream_cfg,
            persona_cfg,
            dedup_enabled,
        }
    }

    pub async fn resolve_key(&self, key_id: &str) -> Result<ApiKeyRecord, RelayError> {
        if let Some(cached) = self.cache.get_key(key_id).await {
            return Ok(cached);
        }
        let record = self.keys.get_key(key_id).await?.ok_or(RelayError::KeyNotFound)?;
        self.cache.put_key(key_id.to_string(), record.clone()).await;
        Ok(record)
    }

    /// §4.3 expansion: hit/miss counters surfaced on `/health`.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn response_shape_config(&self) -> ResponseShapeConfig {
        ResponseShapeConfig {
            subtract_input_token_offset: self.persona_cfg.subtract_input_token_offset,
            input_token_offset: self.persona_cfg.input_token_offset,
            databricks_org_id: self.persona_cfg.databricks_org_id,
        }
    }

    pub async fn handle(&self, req: RelayRequest<'_>) -> Result<RelayOutcome, RelayError> {
        let key = self.resolve_key(req.key_id).await?;

        // 1. Policy checks.
        let model = req.body.get("model").and_then(Value::as_str).unwrap_or("");
        if !key.model_allowed(model) {
            return Err(RelayError::KeyForbiddenModel);
        }
        if !key.client_allowed(req.user_agent)? {
            return Err(RelayError::KeyForbiddenClient);
        }

        // 2. Session hash, account selection, token refresh.
        let first_user_turn = first_user_turn(&req.body);
        let hash = session_hash(&key.id, model, &first_user_turn);
        let account = self.selector.select(&key, Some(&hash)).await?;
        let access_token = self.refresher.get_valid_access_token(&account.id).await?;

        // §4.3: a retried identical request (same key, model, full body)
        // seen again inside the dedup window already had its usage event
        // recorded once; the retry still gets proxied and answered, it just
        // does not bill twice.
        let suppress_usage = if self.dedup_enabled {
            let fingerprint = dedup_fingerprint(&key.id, model, &req.body);
            self.cache.check_and_set_dedup(&fingerprint).await
        } else {
            false
        };

        // 3. Shape body; gate on min-input-tokens for aws/databricks.
        let ceiling = self.accounts.price_ceiling(model).await?;
        let shape_opts = ShapeOptions {
            user_agent: req.user_agent,
            price_ceiling: ceiling,
            operator_system_prompt: self.upstream_cfg.system_prompt.as_deref(),
        };
        let shaped_body = shape_request(&req.body, &shape_opts);
        let genuine = is_genuine_claude_code(req.user_agent, &shaped_body);

        if matches!(key.persona, Persona::Aws | Persona::Databricks) {
            let counted = self
                .token_counter
                .count_input_tokens(&shaped_body, &access_token)
                .await;
            let minimum = self.persona_cfg.min_input_tokens;
            if counted < minimum {
                return Err(RelayError::TokenFloorNotMet { current: counted, minimum });
            }
        }

        let snapshot = self.header_capture.get(&account.id).await?;
        let url = format!("{}/v1/messages", self.upstream_cfg.url);
        let upstream_req = UpstreamRequest {
            url,
            access_token: &access_token,
            api_version: &self.upstream_cfg.api_version,
            beta_header: Some(self.upstream_cfg.beta_header.as_str()),
            proxy: account.proxy.as_ref(),
            downstream_headers: req.downstream_headers,
            captured_snapshot: snapshot.as_ref(),
            is_genuine_claude_code: genuine,
            body: &shaped_body,
        };

        // 4-5. Dispatch with the orchestrator-level retry for transient
        // errors only (§7: base 1s, factor 2, cap 3 attempts).
        if req.stream {
            self.handle_streaming(
                upstream_req,
                &account.id,
                &key,
                model,
                &hash,
                genuine,
                req.downstream_headers,
                suppress_usage,
            )
            .await
        } else {
            self.handle_buffered(
                upstream_req,
                &account.id,
                &key,
                model,
                &hash,
                genuine,
                req.downstream_headers,
                suppress_usage,
            )
            .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_buffered(
        &self,
        upstream_req: UpstreamRequest<'_>,
        account_id: &str,
        key: &ApiKeyRecord,
        model: &str,
        session_hash_val: &str,
        genuine: bool,
        downstream_headers: &[(String, String)],
        suppress_usage: bool,
    ) -> Result<RelayOutcome, RelayError> {
        let mut backoff = RETRY_BASE;
        let mut last_err = None;
        let mut resp = None;
        for attempt in 0..RETRY_CAP_ATTEMPTS {
            match self.upstream.dispatch(upstream_req.clone()).await {
                Ok(r) => {
                    resp = Some(r);
                    break;
                }
                Err(RelayError::UpstreamRateLimited { status, body }) => {
                    self.registry.mark_rate_limited(account_id, Some(session_hash_val)).await?;
                    return Err(RelayError::UpstreamRateLimited { status, body });
                }
                Err(e) if e.retriable() && attempt + 1 < RETRY_CAP_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "retrying buffered dispatch after transient error");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    last_err = Some(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        let resp = match resp {
            Some(r) => r,
            None => return Err(last_err.unwrap_or(RelayError::Cancelled)),
        };

        self.registry.clear_rate_limit(account_id).await?;
        if genuine {
            self.header_capture.capture(account_id, downstream_headers).await?;
        }

        let mut body_value: Value = serde_json::from_str(&resp.body)
            .map_err(|e| RelayError::BodyShapeInvalid(format!("upstream body not JSON: {e}")))?;
        let cfg = self.response_shape_config();
        shape_response_body(&mut body_value, key.persona, &cfg);

        let input_tokens = body_value.get("usage").and_then(|u| u.get("input_tokens")).and_then(Value::as_u64);
        let output_tokens = body_value.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64);

        if !suppress_usage {
            self.usage
                .record(UsageEvent {
                    account_id: account_id.to_string(),
                    key_id: key.id.clone(),
                    model: model.to_string(),
                    input_tokens: input_tokens.unwrap_or(0),
                    output_tokens: output_tokens.unwrap_or(0),
                    cache_creation_input_tokens: body_value
                        .get("usage")
                        .and_then(|u| u.get("cache_creation_input_tokens"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    cache_read_input_tokens: body_value
                        .get("usage")
                        .and_then(|u| u.get("cache_read_input_tokens"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    timestamp_ms: epoch_ms(),
                })
                .await?;
        }

        let headers = match key.persona {
            Persona::Cc => resp.headers,
            _ => synthesize_headers(key.persona, &cfg, input_tokens, output_tokens),
        };

        Ok(RelayOutcome::Buffered {
            status: resp.status,
            headers,
            body: body_value.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_streaming(
        &self,
        upstream_req: UpstreamRequest<'_>,
        account_id: &str,
        key: &ApiKeyRecord,
        model: &str,
        session_hash_val: &str,
        genuine: bool,
        downstream_headers: &[(String, String)],
        suppress_usage: bool,
    ) -> Result<RelayOutcome, RelayError> {
        let mut backoff = RETRY_BASE;
        let mut last_err = None;
        let mut started = None;
        for attempt in 0..RETRY_CAP_ATTEMPTS {
            match self.upstream.dispatch_streaming(upstream_req.clone()).await {
                Ok(pair) => {
                    started = Some(pair);
                    break;
                }
                Err(e) if e.retriable() && attempt + 1 < RETRY_CAP_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "retrying stream dispatch after transient error");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    last_err = Some(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        let (lines, outcome_rx) = match started {
            Some(pair) => pair,
            None => return Err(last_err.unwrap_or(RelayError::Cancelled)),
        };

        if genuine {
            self.header_capture.capture(account_id, downstream_headers).await?;
        }
        self.registry.clear_rate_limit(account_id).await?;

        let cfg = self.response_shape_config();
        let persona = key.persona;
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, RelayError>>(64);
        let usage_sink = self.usage.clone();
        let registry = self.registry.clone();
        let account_id = account_id.to_string();
        let key_id = key.id.clone();
        let model = model.to_string();
        let session_hash_val = session_hash_val.to_string();

        tokio::spawn(async move {
            let mut lines = lines;
            use futures_util::StreamExt;
            while let Some(item) = lines.next().await {
                let forward = match item {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes);
                        let shaped = shape_sse_line(&text, persona, &cfg);
                        Bytes::from(shaped.into_bytes())
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                if tx.send(Ok(forward)).await.is_err() {
                    return;
                }
            }

            if let Ok(StreamOutcome { usage, rate_limited }) = outcome_rx.await {
                if rate_limited {
                    let _ = registry.mark_rate_limited(&account_id, Some(&session_hash_val)).await;
                } else if let Some(tally) = usage {
                    if suppress_usage {
                        return;
                    }
                    let _ = usage_sink
                        .record(UsageEvent {
                            account_id: account_id.clone(),
                            key_id,
                            model,
                            input_tokens: tally.input_tokens.unwrap_or(0),
                            output_tokens: tally.output_tokens.unwrap_or(0),
                            cache_creation_input_tokens: tally.cache_creation_input_tokens,
                            cache_read_input_tokens: tally.cache_read_input_tokens,
                            timestamp_ms: epoch_ms(),
                        })
                        .await;
                }
            }
        });

        let headers = match key.persona {
            Persona::Cc => vec![("content-type".to_string(), "text/event-stream".to_string())],
            _ => {
                let mut h = synthesize_headers(key.persona, &cfg, None, None);
                h.push(("content-type".to_string(), "text/event-stream".to_string()));
                h
            }
        };

        Ok(RelayOutcome::Streaming {
            headers,
            body: ReceiverStream::new(rx),
        })
    }
}

/// First user-turn content, used for the session-hash projection (§9).
fn first_user_turn(body: &Value) -> String {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return String::new();
    };
    for message in messages {
        if message.get("role").and_then(Value::as_str) == Some("user") {
            return match message.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|i| i.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
        }
    }
    String::new()
}

/// §4.3: fingerprint a request by key, model, and exact body so two distinct
/// requests never collide and a byte-identical retry always does.
fn dedup_fingerprint(key_id: &str, model: &str, body: &Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedup_fingerprint_is_stable_and_body_sensitive() {
        let body_a = json!({"model": "claude-sonnet-4", "messages": []});
        let body_b = json!({"model": "claude-sonnet-4", "messages": [{"role": "user", "content": "hi"}]});
        let a = dedup_fingerprint("key-1", "claude-sonnet-4", &body_a);
        let b = dedup_fingerprint("key-1", "claude-sonnet-4", &body_a);
        let c = dedup_fingerprint("key-1", "claude-sonnet-4", &body_b);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
