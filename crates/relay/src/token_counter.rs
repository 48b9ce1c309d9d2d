// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Token counter (C8): upstream "count tokens" call with a character-based
//! fallback, and the minimum-input-token floor enforcement for personas
//! that need it.

use serde_json::{json, Value};

pub struct TokenCounter {
    http: reqwest::Client,
    upstream_url: String,
    api_version: String,
}

impl TokenCounter {
    pub fn new(http: reqwest::Client, upstream_url: String, api_version: String) -> Self {
        Self {
            http,
            upstream_url,
            api_version,
        }
    }

    /// Never fails to the caller — on any network/parse error it falls back
    /// to the deterministic character estimate.
    pub async fn count_input_tokens(&self, shaped_body: &Value, access_token: &str) -> u64 {
        match self.count_via_upstream(shaped_body, access_token).await {
            Ok(count) => count,
            Err(e) => {
                tracing::debug!(error = %e, "count_tokens upstream call failed, using char estimate");
                estimate_char_count(shaped_body)
            }
        }
    }

    async fn count_via_upstream(
        &self,
        shaped_body: &Value,
        access_token: &str,
    ) -> Result<u64, String> {
        let mut reduced = json!({
            "model": shaped_body.get("model").cloned().unwrap_or(Value::Null),
            "messages": shaped_body.get("messages").cloned().unwrap_or(json!([])),
        });
        if let Some(system) = shaped_body.get("system") {
            reduced["system"] = system.clone();
        }
        if let Some(tools) = shaped_body.get("tools") {
            reduced["tools"] = tools.clone();
        }

        let resp = self
            .http
            .post(format!("{}/v1/messages/count_tokens", self.upstream_url))
            .bearer_auth(access_token)
            .header("anthropic-version", &self.api_version)
            .timeout(std::time::Duration::from_secs(10))
            .json(&reduced)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }
        let parsed: Value = resp.json().await.map_err(|e| e.to_string())?;
        parsed
            .get("input_tokens")
            .and_then(Value::as_u64)
            .ok_or_else(|| "missing input_tokens in response".to_string())
    }
}

/// `ceil(total_chars / 3.5)` over every text payload in `messages[*].content`
/// and `system`.
pub fn estimate_char_count(body: &Value) -> u64 {
    let mut total_chars: u64 = 0;

    match body.get("system") {
        Some(Value::String(s)) => total_chars += s.chars().count() as u64,
        Some(Value::Array(items)) => {
            for item in items {
                total_chars += text_chars(item);
            }
        }
        _ => {}
    }

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            match message.get("content") {
                Some(Value::String(s)) => total_chars += s.chars().count() as u64,
                Some(Value::Array(items)) => {
                    for item in items {
                        total_chars += text_chars(item);
                    }
                }
                _ => {}
            }
        }
    }

    // ceil(total_chars / 3.5) == ceil(total_chars * 2 / 7)
    (total_chars * 2).div_ceil(7)
}

fn text_chars(item: &Value) -> u64 {
    if item.get("type").and_then(Value::as_str) == Some("text") {
        item.get("text")
            .and_then(Value::as_str)
            .map(|t| t.chars().count() as u64)
            .unwrap_or(0)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_estimate_covers_system_and_messages() {
        let body = json!({
            "system": [{"type": "text", "text": "0123456"}],
            "messages": [{"role": "user", "content": [{"type": "text", "text": "0123456"}]}],
        });
        // 14 chars total -> ceil(14/3.5) = 4
        assert_eq!(estimate_char_count(&body), 4);
    }

    #[test]
    fn char_estimate_handles_plain_string_content() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(estimate_char_count(&body), 1);
    }
}
