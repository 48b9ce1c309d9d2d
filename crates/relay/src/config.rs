// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Process configuration, loaded env-first with CLI overrides, the way
//! `coopmux::config::MuxConfig` does it — plus an optional TOML file layer
//! for the larger nested blob this service needs.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "relayd", about = "Multi-tenant reverse proxy for the Anthropic Messages API")]
pub struct RelayConfig {
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_HOST")]
    pub host: String,

    #[arg(long, default_value_t = 8080, env = "RELAY_PORT")]
    pub port: u16,

    /// Optional TOML file carrying the full nested configuration blob (§6).
    /// Loaded first; any CLI/env flags set below override it field-for-field.
    #[arg(long, env = "RELAY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub security: SecurityConfig,

    #[command(flatten)]
    pub kv: KvConfig,

    #[command(flatten)]
    pub upstream: UpstreamConfig,

    #[command(flatten)]
    pub proxy: ProxyConfig,

    #[command(flatten)]
    pub performance: PerformanceConfig,

    #[command(flatten)]
    pub system: SystemConfig,

    #[command(flatten)]
    pub personas: PersonaConfig,
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct SecurityConfig {
    #[arg(long, env = "RELAY_JWT_SECRET", default_value = "")]
    #[serde(default)]
    pub jwt_secret: String,

    /// 32 raw bytes, hex-encoded (64 hex chars), used for ChaCha20-Poly1305.
    #[arg(long, env = "RELAY_ENCRYPTION_KEY")]
    pub encryption_key: String,

    #[arg(long, default_value = "sk-ant-", env = "RELAY_API_KEY_PREFIX")]
    #[serde(default = "default_api_key_prefix")]
    pub api_key_prefix: String,
}

fn default_api_key_prefix() -> String {
    "sk-ant-".to_string()
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct KvConfig {
    #[arg(long, default_value = "127.0.0.1", env = "RELAY_KV_HOST")]
    #[serde(default = "default_kv_host")]
    pub host: String,

    #[arg(long, default_value_t = 6379, env = "RELAY_KV_PORT")]
    #[serde(default = "default_kv_port")]
    pub port: u16,

    #[arg(long, env = "RELAY_KV_PASSWORD")]
    pub password: Option<String>,

    #[arg(long, default_value_t = 0, env = "RELAY_KV_DB")]
    #[serde(default)]
    pub db: u8,

    #[arg(long, default_value_t = 16, env = "RELAY_KV_POOL")]
    #[serde(default = "default_kv_pool")]
    pub pool: u32,
}

fn default_kv_host() -> String {
    "127.0.0.1".to_string()
}
fn default_kv_port() -> u16 {
    6379
}
fn default_kv_pool() -> u32 {
    16
}

impl KvConfig {
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct UpstreamConfig {
    #[arg(
        long,
        default_value = "https://api.anthropic.com",
        env = "RELAY_UPSTREAM_URL"
    )]
    #[serde(default = "default_upstream_url")]
    pub url: String,

    #[arg(long, default_value = "2023-06-01", env = "RELAY_API_VERSION")]
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[arg(
        long,
        default_value = "claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14",
        env = "RELAY_BETA_HEADER"
    )]
    #[serde(default = "default_beta_header")]
    pub beta_header: String,

    #[arg(long, env = "RELAY_SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,

    #[arg(long, env = "RELAY_OAUTH_TOKEN_URL", default_value = "https://console.anthropic.com/v1/oauth/token")]
    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,

    #[arg(long, env = "RELAY_OAUTH_CLIENT_ID", default_value = "")]
    #[serde(default)]
    pub oauth_client_id: String,
}

fn default_upstream_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_api_version() -> String {
    "2023-06-01".to_string()
}
fn default_beta_header() -> String {
    "claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14".to_string()
}
fn default_oauth_token_url() -> String {
    "https://console.anthropic.com/v1/oauth/token".to_string()
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct ProxyConfig {
    #[arg(long, default_value_t = 60_000, env = "RELAY_PROXY_TIMEOUT_MS")]
    #[serde(default = "default_proxy_timeout_ms")]
    pub timeout_ms: u64,

    #[arg(long, default_value_t = 3, env = "RELAY_PROXY_MAX_RETRIES")]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_proxy_timeout_ms() -> u64 {
    60_000
}
fn default_max_retries() -> u32 {
    3
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct PerformanceConfig {
    #[arg(long, default_value_t = true, env = "RELAY_KEY_CACHE_ENABLED")]
    #[serde(default = "default_true")]
    pub key_cache_enabled: bool,

    #[arg(long, default_value_t = 60_000, env = "RELAY_KEY_CACHE_TTL_MS")]
    #[serde(default = "default_key_cache_ttl_ms")]
    pub key_cache_ttl_ms: u64,

    #[arg(long, default_value_t = 10_000, env = "RELAY_KEY_CACHE_MAX")]
    #[serde(default = "default_key_cache_max")]
    pub key_cache_max: u64,

    #[arg(long, default_value_t = true, env = "RELAY_DEDUP_ENABLED")]
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,

    #[arg(long, default_value_t = 30_000, env = "RELAY_DEDUP_WINDOW_MS")]
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    #[arg(long, default_value_t = 10_000, env = "RELAY_DEDUP_MAX")]
    #[serde(default = "default_dedup_max")]
    pub dedup_max: u64,

    #[arg(long, default_value_t = true, env = "RELAY_COMPRESSION_ENABLED")]
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    #[arg(long, default_value_t = 6, env = "RELAY_COMPRESSION_LEVEL")]
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    #[arg(long, default_value_t = 1024, env = "RELAY_COMPRESSION_THRESHOLD")]
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: u64,

    #[arg(long, default_value_t = false, env = "RELAY_BATCH_ENABLED")]
    #[serde(default)]
    pub batch_enabled: bool,

    #[arg(long, default_value_t = 50, env = "RELAY_BATCH_SIZE")]
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    #[arg(long, default_value_t = 200, env = "RELAY_BATCH_FLUSH_MS")]
    #[serde(default = "default_batch_flush_ms")]
    pub batch_flush_ms: u64,

    /// (expansion) background proactive refresh sweep interval — §4.5.
    #[arg(long, default_value_t = 60_000, env = "RELAY_TOKEN_REFRESH_SWEEP_MS")]
    #[serde(default = "default_sweep_ms")]
    pub token_refresh_sweep_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_key_cache_ttl_ms() -> u64 {
    60_000
}
fn default_key_cache_max() -> u64 {
    10_000
}
fn default_dedup_window_ms() -> u64 {
    30_000
}
fn default_dedup_max() -> u64 {
    10_000
}
fn default_compression_level() -> u32 {
    6
}
fn default_compression_threshold() -> u64 {
    1024
}
fn default_batch_size() -> u64 {
    50
}
fn default_batch_flush_ms() -> u64 {
    200
}
fn default_sweep_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct SystemConfig {
    #[arg(long, default_value_t = 300_000, env = "RELAY_CLEANUP_INTERVAL_MS")]
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[arg(
        long,
        default_value_t = 604_800_000,
        env = "RELAY_TOKEN_USAGE_RETENTION_MS"
    )]
    #[serde(default = "default_retention_ms")]
    pub token_usage_retention_ms: u64,

    #[arg(
        long,
        default_value_t = 30_000,
        env = "RELAY_HEALTH_CHECK_INTERVAL_MS"
    )]
    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_cleanup_interval_ms() -> u64 {
    300_000
}
fn default_retention_ms() -> u64 {
    604_800_000
}
fn default_health_interval_ms() -> u64 {
    30_000
}

/// (expansion) Persona-specific knobs called out as Open Questions in §9:
/// kept as config rather than constants so product can tune them without a
/// code change.
#[derive(Debug, Clone, clap::Args, Deserialize)]
pub struct PersonaConfig {
    #[arg(long, default_value_t = true, env = "RELAY_SUBTRACT_INPUT_TOKEN_OFFSET")]
    #[serde(default = "default_true")]
    pub subtract_input_token_offset: bool,

    #[arg(long, default_value_t = 14, env = "RELAY_INPUT_TOKEN_OFFSET")]
    #[serde(default = "default_offset")]
    pub input_token_offset: u64,

    #[arg(long, default_value_t = 94_787_086_326_342, env = "RELAY_DATABRICKS_ORG_ID")]
    #[serde(default = "default_databricks_org_id")]
    pub databricks_org_id: u64,

    #[arg(long, default_value_t = 250, env = "RELAY_MIN_INPUT_TOKENS")]
    #[serde(default = "default_min_input_tokens")]
    pub min_input_tokens: u64,
}

fn default_offset() -> u64 {
    14
}
fn default_databricks_org_id() -> u64 {
    94_787_086_326_342
}
fn default_min_input_tokens() -> u64 {
    250
}

impl RelayConfig {
    /// Loads `config_file`, if set, and overlays any fields it carries onto
    /// the CLI/env-derived values. CLI/env flags that were explicitly passed
    /// still win in `clap`'s own precedence; this only fills in the gap for
    /// fields the file sets and the flags left at their built-in default.
    pub fn apply_config_file_overlay(&mut self) -> Result<(), RelayError> {
        let Some(path) = self.config_file.clone() else {
            return Ok(());
        };
        let overlay = load_config_file(&path)?;
        if let Some(security) = overlay.security {
            if let Some(key) = security.encryption_key {
                self.security.encryption_key = key;
            }
        }
        Ok(())
    }

    /// Decode `security.encryption_key` into the 32-byte AEAD key.
    pub fn encryption_key_bytes(&self) -> Result<[u8; 32], RelayError> {
        let raw = hex::decode(self.security.encryption_key.trim())
            .map_err(|e| RelayError::Config(format!("encryption_key is not valid hex: {e}")))?;
        raw.try_into()
            .map_err(|_| RelayError::Config("encryption_key must decode to exactly 32 bytes".into()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Partial TOML overlay matching the `config_file` layer described in §6.
/// Any section omitted from the file keeps its CLI/env-derived default.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub security: Option<SecurityConfigFile>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SecurityConfigFile {
    pub encryption_key: Option<String>,
}

pub fn load_config_file(path: &PathBuf) -> Result<ConfigFile, RelayError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("reading {}: {e}", path.display())))?;
    toml_lite::parse(&text)
}

/// Minimal TOML reader covering the one nested layer this service actually
/// needs (`[security] encryption_key = "..."`). A full `toml` dependency was
/// not warranted for a single optional override field.
mod toml_lite {
    use super::{ConfigFile, SecurityConfigFile};
    use crate::error::RelayError;

    pub fn parse(text: &str) -> Result<ConfigFile, RelayError> {
        let mut cfg = ConfigFile::default();
        let mut section = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"').to_string();
            if section == "security" && key == "encryption_key" {
                cfg.security.get_or_insert_with(SecurityConfigFile::default).encryption_key = Some(value);
            }
        }
        Ok(cfg)
    }
}
