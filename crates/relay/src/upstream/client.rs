// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! The concrete HTTPS dispatch for C9. Non-streaming requests return a
//! buffered `{status, headers, body_string}`; streaming requests hand back a
//! byte stream the transport layer forwards to the downstream SSE response,
//! plus a oneshot that resolves once the line-buffered parser has extracted
//! usage and rate-limit signals from the tail of the stream.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use super::{DEFAULT_USER_AGENT, STRIPPED_DOWNSTREAM_HEADERS};
use crate::error::{RelayError, UpstreamTransportKind};
use crate::model::{HeaderSnapshot, ProxyConfigRef};

const RATE_LIMIT_NEEDLE: &str = "exceed your account's rate limit";

#[derive(Clone)]
pub struct UpstreamRequest<'a> {
    pub url: String,
    pub access_token: &'a str,
    pub api_version: &'a str,
    pub beta_header: Option<&'a str>,
    pub proxy: Option<&'a ProxyConfigRef>,
    pub downstream_headers: &'a [(String, String)],
    pub captured_snapshot: Option<&'a HeaderSnapshot>,
    pub is_genuine_claude_code: bool,
    pub body: &'a Value,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct UsageTally {
    pub model: Option<String>,
    pub input_tokens: Option<u64>,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub output_tokens: Option<u64>,
    emitted: bool,
}

impl UsageTally {
    pub fn complete(&self) -> bool {
        self.input_tokens.is_some() && self.output_tokens.is_some()
    }
}

#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub usage: Option<UsageTally>,
    pub rate_limited: bool,
}

pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn client_for(&self, proxy: Option<&ProxyConfigRef>) -> Result<reqwest::Client, RelayError> {
        let Some(proxy) = proxy else {
            return Ok(self.http.clone());
        };
        let proxy_url = proxy.to_url();
        let mut builder = reqwest::Client::builder();
        let mut p = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| RelayError::Config(format!("bad proxy url {proxy_url}: {e}")))?;
        if let Some((user, pass)) = &proxy.basic_auth {
            p = p.basic_auth(user, pass);
        }
        builder = builder.proxy(p);
        builder
            .build()
            .map_err(|e| RelayError::Config(format!("building proxied client: {e}")))
    }

    fn build_headers(&self, req: &UpstreamRequest<'_>) -> reqwest::header::HeaderMap {
        fn insert(headers: &mut reqwest::header::HeaderMap, k: &str, v: String) {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(&v),
            ) {
                headers.insert(name, value);
            }
        }

        let mut headers = reqwest::header::HeaderMap::new();

        insert(&mut headers, "content-type", "application/json".to_string());
        insert(
            &mut headers,
            "authorization",
            format!("Bearer {}", req.access_token),
        );
        insert(
            &mut headers,
            "anthropic-version",
            req.api_version.to_string(),
        );
        if let Some(beta) = req.beta_header {
            insert(&mut headers, "anthropic-beta", beta.to_string());
        }

        let mut seen_lower: HashMap<String, ()> = HashMap::new();
        for (k, v) in req.downstream_headers {
            let lower = k.to_ascii_lowercase();
            if STRIPPED_DOWNSTREAM_HEADERS.contains(&lower.as_str()) && lower != "x-request-id" {
                continue;
            }
            insert(&mut headers, k, v.clone());
            seen_lower.insert(lower, ());
        }

        if !req.is_genuine_claude_code {
            if let Some(snapshot) = req.captured_snapshot {
                for (k, v) in &snapshot.headers {
                    let lower = k.to_ascii_lowercase();
                    if !seen_lower.contains_key(&lower) {
                        insert(&mut headers, k, v.clone());
                    }
                }
            }
        }

        if !headers.contains_key("user-agent") {
            insert(&mut headers, "user-agent", DEFAULT_USER_AGENT.to_string());
        }

        headers
    }

    pub async fn dispatch(&self, req: UpstreamRequest<'_>) -> Result<UpstreamResponse, RelayError> {
        let client = self.client_for(req.proxy)?;
        let headers = self.build_headers(&req);

        let resp = client
            .post(&req.url)
            .headers(headers)
            .json(req.body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status().as_u16();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = resp.text().await.map_err(map_transport_error)?;

        if status == 429 || body_is_rate_limited(&body) {
            return Err(RelayError::UpstreamRateLimited { status, body });
        }

        Ok(UpstreamResponse { status, headers, body })
    }

    /// Dispatches a streaming request and returns a channel of raw SSE lines
    /// (forwarded verbatim to the downstream response) plus a oneshot that
    /// resolves with the extracted usage/rate-limit signal once the upstream
    /// stream ends or the downstream receiver is dropped (cancellation).
    pub async fn dispatch_streaming(
        &self,
        req: UpstreamRequest<'_>,
    ) -> Result<(ReceiverStream<Result<Bytes, RelayError>>, oneshot::Receiver<StreamOutcome>), RelayError> {
        let client = self.client_for(req.proxy)?;
        let headers = self.build_headers(&req);

        let resp = client
            .post(&req.url)
            .headers(headers)
            .json(req.body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let (tx, rx) = mpsc::channel::<Result<Bytes, RelayError>>(64);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let rate_limited = status.as_u16() == 429 || body_is_rate_limited(&body);
            tokio::spawn(async move {
                let envelope = format!(
                    "event: error\ndata: {}\n\n",
                    serde_json::json!({"type": "error", "error": {"status": status.as_u16(), "body": body}})
                );
                let _ = tx.send(Ok(Bytes::from(envelope))).await;
                let _ = outcome_tx.send(StreamOutcome {
                    usage: None,
                    rate_limited,
                });
            });
            return Ok((ReceiverStream::new(rx), outcome_rx));
        }

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            let mut tally = UsageTally::default();
            let mut rate_limited = false;

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(map_transport_error(e))).await;
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    inspect_line(&line, &mut tally, &mut rate_limited);
                    if tx.send(Ok(Bytes::from(line))).await.is_err() {
                        // downstream disconnected; abandon the upstream stream.
                        return;
                    }
                }
            }

            if !buf.is_empty() {
                inspect_line(&buf, &mut tally, &mut rate_limited);
                let _ = tx.send(Ok(Bytes::from(buf))).await;
            }

            let outcome = StreamOutcome {
                usage: if tally.complete() { Some(tally) } else { None },
                rate_limited,
            };
            let _ = outcome_tx.send(outcome);
        });

        Ok((ReceiverStream::new(rx), outcome_rx))
    }
}

fn body_is_rate_limited(body: &str) -> bool {
    body.to_ascii_lowercase().contains(&RATE_LIMIT_NEEDLE.to_ascii_lowercase())
}

/// §4.9: per-line SSE inspection. Mutates `tally`/`rate_limited` in place;
/// the caller still forwards the line verbatim regardless of parse outcome.
fn inspect_line(line: &[u8], tally: &mut UsageTally, rate_limited: &mut bool) {
    let Ok(text) = std::str::from_utf8(line) else {
        return;
    };
    let text = text.trim_end_matches(['\n', '\r']);
    let Some(json_part) = text.strip_prefix("data: ").or_else(|| text.strip_prefix("data:")) else {
        return;
    };
    let Ok(value) = serde_json::from_str::<Value>(json_part.trim()) else {
        return;
    };

    match value.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            if let Some(usage) = value.get("message").and_then(|m| m.get("usage")) {
                tally.input_tokens = usage.get("input_tokens").and_then(Value::as_u64);
                tally.cache_creation_input_tokens =
                    usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0);
                tally.cache_read_input_tokens =
                    usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0);
                tally.model = value
                    .get("message")
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        Some("message_delta") => {
            if let Some(output_tokens) = value.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64) {
                if !tally.emitted {
                    tally.output_tokens = Some(output_tokens);
                    if tally.complete() {
                        tally.emitted = true;
                    }
                }
            }
        }
        Some("error") => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if message.to_ascii_lowercase().contains(&RATE_LIMIT_NEEDLE.to_ascii_lowercase()) {
                *rate_limited = true;
            }
        }
        _ => {}
    }
}

fn map_transport_error(err: reqwest::Error) -> RelayError {
    let kind = if err.is_timeout() {
        UpstreamTransportKind::Timeout
    } else if err.is_connect() {
        UpstreamTransportKind::Refused
    } else if err.to_string().to_ascii_lowercase().contains("dns") {
        UpstreamTransportKind::Dns
    } else if err.to_string().to_ascii_lowercase().contains("reset") {
        UpstreamTransportKind::Reset
    } else {
        UpstreamTransportKind::Other
    };
    RelayError::UpstreamTransport(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_line_captures_message_start_usage() {
        let mut tally = UsageTally::default();
        let mut rate_limited = false;
        let line = b"data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4\",\"usage\":{\"input_tokens\":10,\"cache_read_input_tokens\":2,\"cache_creation_input_tokens\":1}}}\n";
        inspect_line(line, &mut tally, &mut rate_limited);
        assert_eq!(tally.input_tokens, Some(10));
        assert_eq!(tally.cache_read_input_tokens, 2);
        assert!(!tally.complete());
    }

    #[test]
    fn inspect_line_completes_on_message_delta() {
        let mut tally = UsageTally {
            input_tokens: Some(10),
            ..Default::default()
        };
        let mut rate_limited = false;
        let line = b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":5}}\n";
        inspect_line(line, &mut tally, &mut rate_limited);
        assert_eq!(tally.output_tokens, Some(5));
        assert!(tally.complete());
    }

    #[test]
    fn inspect_line_detects_rate_limit_error_event() {
        let mut tally = UsageTally::default();
        let mut rate_limited = false;
        let line = b"data: {\"type\":\"error\",\"error\":{\"message\":\"You exceed your account's rate limit, please retry later\"}}\n";
        inspect_line(line, &mut tally, &mut rate_limited);
        assert!(rate_limited);
    }

    #[test]
    fn non_data_lines_are_ignored_by_the_parser() {
        let mut tally = UsageTally::default();
        let mut rate_limited = false;
        inspect_line(b": comment\n", &mut tally, &mut rate_limited);
        inspect_line(b"event: ping\n", &mut tally, &mut rate_limited);
        assert!(!tally.complete());
        assert!(!rate_limited);
    }
}
