// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Request shaper (C7): persona-aware request body rewrites. Operates on a
//! deep copy of the downstream body (`Value::clone` is a deep copy in
//! `serde_json`).

use serde_json::{json, Value};

use super::{is_genuine_claude_code, CLAUDE_CODE_SYSTEM_PROMPT};

pub struct ShapeOptions<'a> {
    pub user_agent: &'a str,
    pub price_ceiling: Option<u64>,
    pub operator_system_prompt: Option<&'a str>,
}

/// Applies every §4.7 rewrite in place and returns the shaped body.
pub fn shape_request(body: &Value, opts: &ShapeOptions<'_>) -> Value {
    let mut body = body.clone();

    clamp_max_tokens(&mut body, opts.price_ceiling);
    scrub_cache_control_ttl(&mut body);
    normalize_system_prompt(&mut body, opts.user_agent);
    if let Some(extra) = opts.operator_system_prompt {
        append_operator_prompt(&mut body, extra);
    }
    drop_empty_system(&mut body);

    body
}

fn clamp_max_tokens(body: &mut Value, ceiling: Option<u64>) {
    let Some(ceiling) = ceiling else { return };
    if let Some(max_tokens) = body.get("max_tokens").and_then(Value::as_u64) {
        if max_tokens > ceiling {
            body["max_tokens"] = json!(ceiling);
        }
    }
}

fn scrub_cache_control_ttl(body: &mut Value) {
    if let Some(system) = body.get_mut("system").and_then(Value::as_array_mut) {
        for item in system.iter_mut() {
            strip_ttl(item);
        }
    }
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages.iter_mut() {
            if let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) {
                for item in content.iter_mut() {
                    strip_ttl(item);
                }
            }
        }
    }
}

fn strip_ttl(item: &mut Value) {
    if let Some(cache_control) = item.get_mut("cache_control").and_then(Value::as_object_mut) {
        cache_control.remove("ttl");
    }
}

fn s_block() -> Value {
    json!({
        "type": "text",
        "text": CLAUDE_CODE_SYSTEM_PROMPT,
        "cache_control": {"type": "ephemeral"},
    })
}

fn is_s_text_block(item: &Value) -> bool {
    item.get("type").and_then(Value::as_str) == Some("text")
        && item.get("text").and_then(Value::as_str) == Some(CLAUDE_CODE_SYSTEM_PROMPT)
}

fn normalize_system_prompt(body: &mut Value, user_agent: &str) {
    if is_genuine_claude_code(user_agent, body) {
        return;
    }

    match body.get("system").cloned() {
        None => {
            body["system"] = json!([s_block()]);
        }
        Some(Value::String(s)) if s == CLAUDE_CODE_SYSTEM_PROMPT => {
            body["system"] = json!([s_block()]);
        }
        Some(Value::String(s)) => {
            body["system"] = json!([s_block(), {"type": "text", "text": s}]);
        }
        Some(Value::Array(items)) => {
            let first_is_s = items.first().map(is_s_text_block).unwrap_or(false);
            if !first_is_s {
                let mut rest: Vec<Value> = items.into_iter().filter(|i| !is_s_text_block(i)).collect();
                rest.insert(0, s_block());
                body["system"] = Value::Array(rest);
            }
        }
        Some(_) => {}
    }
}

fn append_operator_prompt(body: &mut Value, extra: &str) {
    if extra.trim().is_empty() {
        return;
    }
    let Some(system) = body.get_mut("system").and_then(Value::as_array_mut) else {
        return;
    };
    let already_present = system
        .iter()
        .any(|item| item.get("text").and_then(Value::as_str) == Some(extra));
    if !already_present {
        system.push(json!({"type": "text", "text": extra}));
    }
}

fn drop_empty_system(body: &mut Value) {
    let is_empty = match body.get("system") {
        Some(Value::Array(items)) => items.iter().all(|item| {
            item.get("text")
                .and_then(Value::as_str)
                .map(|t| t.trim().is_empty())
                .unwrap_or(true)
        }),
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    };
    if is_empty {
        if let Some(obj) = body.as_object_mut() {
            obj.remove("system");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(user_agent: &'static str) -> ShapeOptions<'static> {
        ShapeOptions {
            user_agent,
            price_ceiling: None,
            operator_system_prompt: None,
        }
    }

    #[test]
    fn s1_genuine_claude_code_passthrough() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "system": [{"type": "text", "text": CLAUDE_CODE_SYSTEM_PROMPT}],
            "messages": [{"role": "user", "content": "ping"}],
        });
        let shaped = shape_request(&body, &opts("claude-cli/1.0.57 (external, cli)"));
        assert_eq!(shaped["system"], body["system"]);
    }

    #[test]
    fn s2_non_genuine_client_gets_s_block_prepended() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let shaped = shape_request(&body, &opts("curl/8"));
        assert_eq!(shaped["system"][0]["text"], CLAUDE_CODE_SYSTEM_PROMPT);
    }

    #[test]
    fn string_system_not_equal_to_s_is_wrapped_and_kept() {
        let body = json!({"system": "be nice", "messages": []});
        let shaped = shape_request(&body, &opts("curl/8"));
        assert_eq!(shaped["system"][0]["text"], CLAUDE_CODE_SYSTEM_PROMPT);
        assert_eq!(shaped["system"][1]["text"], "be nice");
    }

    #[test]
    fn cache_control_ttl_is_scrubbed() {
        let body = json!({
            "system": [{"type": "text", "text": "x", "cache_control": {"type": "ephemeral", "ttl": "1h"}}],
            "messages": [{"role": "user", "content": [{"type": "text", "text": "y", "cache_control": {"ttl": "5m"}}]}],
        });
        let shaped = shape_request(&body, &opts("claude-cli/1.0.0"));
        assert!(shaped["system"][0]["cache_control"].get("ttl").is_none());
        assert!(shaped["messages"][0]["content"][0]["cache_control"].get("ttl").is_none());
    }

    #[test]
    fn max_tokens_is_clamped_to_price_ceiling() {
        let body = json!({"max_tokens": 8192, "messages": []});
        let o = ShapeOptions { price_ceiling: Some(4096), ..opts("curl/8") };
        let shaped = shape_request(&body, &o);
        assert_eq!(shaped["max_tokens"], 4096);
    }

    #[test]
    fn idempotent_application() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let o = ShapeOptions { operator_system_prompt: Some("extra rules"), ..opts("curl/8") };
        let once = shape_request(&body, &o);
        let twice = shape_request(&once, &o);
        assert_eq!(once, twice);
    }
}
