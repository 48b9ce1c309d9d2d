// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Data model (§3) and the collaborator traits the core depends on: a
//! key-store query returning a validated API-key record, an account-store
//! query returning decrypted account records, and a usage-sink that accepts
//! token-accounting events. Implementations of these traits (database,
//! admin CRUD, price-table fetcher) live outside the core.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    /// Native passthrough.
    Cc,
    /// Native with synthetic Anthropic headers.
    Anthropic,
    /// Bedrock-style rewrite.
    Aws,
    /// Databricks-style rewrite.
    Databricks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    Shared,
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyScheme {
    Socks5,
    Http,
    Https,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfigRef {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub basic_auth: Option<(String, String)>,
}

impl ProxyConfigRef {
    pub fn to_url(&self) -> String {
        let scheme = match self.scheme {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
        };
        match &self.basic_auth {
            Some((user, pass)) => format!("{scheme}://{user}:{pass}@{}:{}", self.host, self.port),
            None => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }
}

/// Decrypted OAuth blob. Exactly one per account (§3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthBlob {
    pub access_token: String,
    pub refresh_token: String,
    /// Wall-clock epoch milliseconds.
    pub expires_at_ms: u64,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStatus {
    Unlimited,
    Limited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub proxy: Option<ProxyConfigRef>,
    pub oauth: OAuthBlob,
    pub last_used_at: u64,
    pub last_refresh_at: u64,
    pub rate_limited_at: Option<u64>,
    pub status: RateLimitStatus,
    pub binding_mode: BindingMode,
    /// §4.5 step 3: set when the last OAuth refresh attempt failed: the
    /// account is left looking like any other one in the registry, but the
    /// selector will not pick it until a refresh succeeds and clears this.
    pub last_refresh_error: Option<String>,
}

impl Account {
    /// §4.4: `is_rate_limited` additionally auto-clears after ≥ 1h.
    pub fn is_rate_limited(&self, now_ms: u64) -> bool {
        match (self.status, self.rate_limited_at) {
            (RateLimitStatus::Limited, Some(at)) => now_ms.saturating_sub(at) < 3_600_000,
            _ => false,
        }
    }

    /// Rate-limited or broken — either way the selector should skip it.
    pub fn is_unusable(&self, now_ms: u64) -> bool {
        self.is_rate_limited(now_ms) || self.last_refresh_error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub display_name: String,
    pub persona: Persona,
    pub enable_model_restriction: bool,
    pub restricted_models: HashSet<String>,
    pub bound_account_id: Option<String>,
    /// Regex over user-agent; compiled lazily by the caller (not persisted
    /// compiled — `Regex` is not `Serialize`).
    pub client_identity_restriction: Option<String>,
}

impl ApiKeyRecord {
    pub fn model_allowed(&self, model: &str) -> bool {
        if !self.enable_model_restriction {
            return true;
        }
        self.restricted_models.contains(model)
    }

    pub fn client_allowed(&self, user_agent: &str) -> Result<bool, RelayError> {
        let Some(pattern) = &self.client_identity_restriction else {
            return Ok(true);
        };
        let re = Regex::new(pattern)
            .map_err(|e| RelayError::Config(format!("bad client_identity_restriction regex: {e}")))?;
        Ok(re.is_match(user_agent))
    }
}

/// §4.11: last-observed genuine Claude-Code headers for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderSnapshot {
    pub headers: Vec<(String, String)>,
}

/// One token-accounting event, emitted exactly once per successful request
/// (invariant 1, §8).
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub account_id: String,
    pub key_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub timestamp_ms: u64,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, RelayError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn price_ceiling(&self, model: &str) -> Result<Option<u64>, RelayError>;
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, event: UsageEvent) -> Result<(), RelayError>;
}

/// In-memory `KeyStore`/`AccountStore`/`UsageSink` used by tests and by
/// `relayd --dev` to run without external collaborators.
pub struct InMemoryCollaborators {
    pub keys: std::collections::HashMap<String, ApiKeyRecord>,
    pub price_ceilings: std::collections::HashMap<String, u64>,
    pub recorded: tokio::sync::Mutex<Vec<UsageEvent>>,
}

impl Default for InMemoryCollaborators {
    fn default() -> Self {
        Self {
            keys: std::collections::HashMap::new(),
            price_ceilings: std::collections::HashMap::new(),
            recorded: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl KeyStore for InMemoryCollaborators {
    async fn get_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, RelayError> {
        Ok(self.keys.get(key_id).cloned())
    }
}

#[async_trait]
impl AccountStore for InMemoryCollaborators {
    async fn price_ceiling(&self, model: &str) -> Result<Option<u64>, RelayError> {
        Ok(self.price_ceilings.get(model).copied())
    }
}

#[async_trait]
impl UsageSink for InMemoryCollaborators {
    async fn record(&self, event: UsageEvent) -> Result<(), RelayError> {
        self.recorded.lock().await.push(event);
        Ok(())
    }
}
