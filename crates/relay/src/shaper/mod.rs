// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Persona-aware body rewrites (C7 request shaper, C10 response shaper).

pub mod request;
pub mod response;

pub const CLAUDE_CODE_SYSTEM_PROMPT: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

/// Genuine-Claude-Code detection (§4.7, GLOSSARY): user-agent matches
/// `claude-cli/\d+\.\d+\.\d+` AND the first `system` element is a text block
/// equal to [`CLAUDE_CODE_SYSTEM_PROMPT`].
pub fn is_genuine_claude_code(user_agent: &str, body: &serde_json::Value) -> bool {
    if !user_agent_is_claude_cli(user_agent) {
        return false;
    }
    first_system_text(body).map(|t| t == CLAUDE_CODE_SYSTEM_PROMPT).unwrap_or(false)
}

pub fn user_agent_is_claude_cli(user_agent: &str) -> bool {
    let Some(rest) = user_agent.strip_prefix("claude-cli/") else {
        return false;
    };
    let version = rest.split(|c: char| !c.is_ascii_digit() && c != '.').next().unwrap_or("");
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn first_system_text(body: &serde_json::Value) -> Option<String> {
    match body.get("system") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Array(items)) => {
            let first = items.first()?;
            if first.get("type")?.as_str()? == "text" {
                Some(first.get("text")?.as_str()?.to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognizes_genuine_claude_cli() {
        assert!(user_agent_is_claude_cli("claude-cli/1.0.57 (external, cli)"));
        assert!(!user_agent_is_claude_cli("curl/8.4.0"));
        assert!(!user_agent_is_claude_cli("claude-cli/1.0 (external, cli)"));
    }

    #[test]
    fn genuine_requires_both_ua_and_system_text() {
        let body = json!({
            "system": [{"type": "text", "text": CLAUDE_CODE_SYSTEM_PROMPT}],
        });
        assert!(is_genuine_claude_code("claude-cli/1.0.57 (external, cli)", &body));
        assert!(!is_genuine_claude_code("curl/8", &body));

        let other_body = json!({"system": [{"type": "text", "text": "something else"}]});
        assert!(!is_genuine_claude_code("claude-cli/1.0.57 (external, cli)", &other_body));
    }
}
