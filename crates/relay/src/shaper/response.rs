// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Response shaper (C10): persona-aware response/SSE rewrite of identifiers,
//! usage math, and response headers. Pure functions over the already
//! obtained upstream response.

use rand::Rng;
use serde_json::Value;

use crate::model::Persona;

#[derive(Debug, Clone, Copy)]
pub struct ResponseShapeConfig {
    pub subtract_input_token_offset: bool,
    pub input_token_offset: u64,
    pub databricks_org_id: u64,
}

fn floor_subtract(value: u64, offset: u64) -> u64 {
    if value <= offset {
        value
    } else {
        value - offset
    }
}

fn rewrite_id(id: &str) -> String {
    if let Some(rest) = id.strip_prefix("msg_") {
        format!("msg_bdrk_{rest}")
    } else if let Some(rest) = id.strip_prefix("toolu_") {
        format!("toolu_bdrk_{rest}")
    } else {
        id.to_string()
    }
}

fn rewrite_ids_in_place(body: &mut Value) {
    if let Some(id) = body.get("id").and_then(Value::as_str).map(rewrite_id) {
        body["id"] = Value::String(id);
    }
    if let Some(message) = body.get_mut("message") {
        if let Some(id) = message.get("id").and_then(Value::as_str).map(rewrite_id) {
            message["id"] = Value::String(id);
        }
        rewrite_content_ids(message);
    }
    rewrite_content_ids(body);
}

fn rewrite_content_ids(container: &mut Value) {
    if let Some(content) = container.get_mut("content").and_then(Value::as_array_mut) {
        for item in content.iter_mut() {
            if item.get("type").and_then(Value::as_str) == Some("tool_use") {
                if let Some(id) = item.get("id").and_then(Value::as_str).map(rewrite_id) {
                    item["id"] = Value::String(id);
                }
            }
        }
    }
}

/// Applies persona usage math to any `usage` object found at `usage_path`
/// (top-level `usage`, or `message.usage` inside an SSE envelope).
fn shape_usage_object(usage: &mut Value, persona: Persona, cfg: &ResponseShapeConfig) {
    let orig_input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let orig_cache_read = usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let orig_cache_creation = usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0);

    let offset = if cfg.subtract_input_token_offset { cfg.input_token_offset } else { 0 };

    match persona {
        Persona::Cc | Persona::Anthropic => {
            usage["input_tokens"] = Value::from(floor_subtract(orig_input, offset));
        }
        Persona::Aws => {
            usage["input_tokens"] = Value::from(floor_subtract(orig_input, offset));
        }
        Persona::Databricks => {
            let total = orig_input + orig_cache_read + orig_cache_creation;
            usage["input_tokens"] = Value::from(floor_subtract(total, offset));
            usage["cache_read_input_tokens"] = Value::from(0u64);
            usage["cache_creation_input_tokens"] = Value::from(0u64);
        }
    }
}

fn shape_usage_in_place(body: &mut Value, persona: Persona, cfg: &ResponseShapeConfig) {
    if let Some(usage) = body.get_mut("usage") {
        shape_usage_object(usage, persona, cfg);
    }
    if let Some(usage) = body.get_mut("message").and_then(|m| m.get_mut("usage")) {
        shape_usage_object(usage, persona, cfg);
    }
}

/// Shapes a full, non-streaming JSON response body in place.
pub fn shape_response_body(body: &mut Value, persona: Persona, cfg: &ResponseShapeConfig) {
    shape_usage_in_place(body, persona, cfg);
    if matches!(persona, Persona::Aws | Persona::Databricks) {
        rewrite_ids_in_place(body);
    }
}

fn random_alnum(rng: &mut impl Rng, n: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..n).map(|_| CHARS[rng.random_range(0..CHARS.len())] as char).collect()
}

/// §6: persona-specific synthesized response headers. `real_usage`, when
/// known, overrides the fabricated token counts.
pub fn synthesize_headers(
    persona: Persona,
    cfg: &ResponseShapeConfig,
    real_input_tokens: Option<u64>,
    real_output_tokens: Option<u64>,
) -> Vec<(String, String)> {
    let mut rng = rand::rng();
    match persona {
        Persona::Cc => Vec::new(),
        Persona::Anthropic => vec![
            ("anthropic-ratelimit-requests-limit".into(), "1000".into()),
            ("anthropic-ratelimit-requests-remaining".into(), "999".into()),
            ("anthropic-ratelimit-tokens-limit".into(), "100000".into()),
            ("anthropic-ratelimit-tokens-remaining".into(), "99000".into()),
            ("request-id".into(), format!("req_{}", random_alnum(&mut rng, 24))),
            ("anthropic-organization-id".into(), "org-relay".into()),
            ("cf-ray".into(), format!("{}-IAD", random_alnum(&mut rng, 16))),
            ("server".into(), "cloudflare".into()),
        ],
        Persona::Aws => {
            let input = real_input_tokens.unwrap_or_else(|| rng.random_range(100..2000));
            let output = real_output_tokens.unwrap_or_else(|| rng.random_range(10..500));
            vec![
                ("x-amzn-requestid".into(), uuid::Uuid::new_v4().to_string()),
                (
                    "x-amzn-bedrock-invocation-latency".into(),
                    rng.random_range(1000..3000).to_string(),
                ),
                ("x-amzn-bedrock-input-token-count".into(), input.to_string()),
                ("x-amzn-bedrock-output-token-count".into(), output.to_string()),
            ]
        }
        Persona::Databricks => {
            let mut headers = synthesize_headers(Persona::Aws, cfg, real_input_tokens, real_output_tokens);
            headers.push(("x-databricks-org-id".into(), cfg.databricks_org_id.to_string()));
            headers.push(("server".into(), "databricks".into()));
            headers.push((
                "strict-transport-security".into(),
                "max-age=31536000; includeSubDomains".into(),
            ));
            headers
        }
    }
}

/// §4.10: line-oriented SSE shaping. `data: <json>` lines are parsed,
/// transformed, and re-serialized; `[DONE]` and non-data lines pass through
/// verbatim; lines that fail to parse pass through unchanged.
pub fn shape_sse_line(line: &str, persona: Persona, cfg: &ResponseShapeConfig) -> String {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    let Some(json_part) = trimmed.strip_prefix("data: ").or_else(|| trimmed.strip_prefix("data:")) else {
        return line.to_string();
    };
    let json_part = json_part.trim();
    if json_part == "[DONE]" {
        return line.to_string();
    }
    let Ok(mut value) = serde_json::from_str::<Value>(json_part) else {
        return line.to_string();
    };

    shape_usage_in_place(&mut value, persona, cfg);
    if matches!(persona, Persona::Aws | Persona::Databricks) {
        rewrite_ids_in_place(&mut value);
    }

    format!("data: {}\n", value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> ResponseShapeConfig {
        ResponseShapeConfig {
            subtract_input_token_offset: true,
            input_token_offset: 14,
            databricks_org_id: 94_787_086_326_342,
        }
    }

    #[test]
    fn cc_subtracts_offset_with_floor() {
        let mut body = json!({"usage": {"input_tokens": 100}});
        shape_response_body(&mut body, Persona::Cc, &cfg());
        assert_eq!(body["usage"]["input_tokens"], 86);

        let mut small = json!({"usage": {"input_tokens": 5}});
        shape_response_body(&mut small, Persona::Cc, &cfg());
        assert_eq!(small["usage"]["input_tokens"], 5);
    }

    #[test]
    fn s4_bedrock_rewrite() {
        let mut body = json!({
            "id": "msg_01ABC",
            "content": [{"type": "tool_use", "id": "toolu_42"}],
            "usage": {
                "input_tokens": 1000,
                "cache_read_input_tokens": 200,
                "cache_creation_input_tokens": 50,
                "output_tokens": 30,
            },
        });
        shape_response_body(&mut body, Persona::Databricks, &cfg());
        assert_eq!(body["id"], "msg_bdrk_01ABC");
        assert_eq!(body["content"][0]["id"], "toolu_bdrk_42");
        assert_eq!(body["usage"]["input_tokens"], 1236);
        assert_eq!(body["usage"]["cache_read_input_tokens"], 0);
        assert_eq!(body["usage"]["cache_creation_input_tokens"], 0);
        assert_eq!(body["usage"]["output_tokens"], 30);
    }

    #[test]
    fn aws_keeps_cache_counters() {
        let mut body = json!({
            "usage": {"input_tokens": 1000, "cache_read_input_tokens": 200, "cache_creation_input_tokens": 50},
        });
        shape_response_body(&mut body, Persona::Aws, &cfg());
        assert_eq!(body["usage"]["input_tokens"], 986);
        assert_eq!(body["usage"]["cache_read_input_tokens"], 200);
        assert_eq!(body["usage"]["cache_creation_input_tokens"], 50);
    }

    #[test]
    fn sse_done_and_non_data_lines_pass_through() {
        assert_eq!(shape_sse_line("data: [DONE]\n", Persona::Cc, &cfg()), "data: [DONE]\n");
        assert_eq!(shape_sse_line("event: ping\n", Persona::Cc, &cfg()), "event: ping\n");
        assert_eq!(shape_sse_line("not json at all\n", Persona::Cc, &cfg()), "not json at all\n");
    }

    #[test]
    fn sse_message_start_usage_is_shaped() {
        let line = "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_01X\",\"usage\":{\"input_tokens\":100}}}\n";
        let shaped = shape_sse_line(line, Persona::Databricks, &cfg());
        let value: Value = serde_json::from_str(shaped.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(value["message"]["id"], "msg_bdrk_01X");
        assert_eq!(value["message"]["usage"]["input_tokens"], 86);
    }

    proptest::proptest! {
        #[test]
        fn floor_subtract_never_underflows(value: u64, offset: u64) {
            let result = floor_subtract(value, offset);
            proptest::prop_assert!(result <= value);
        }
    }
}
