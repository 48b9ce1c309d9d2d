// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! End-to-end smoke tests against the real axum router. These require a
//! reachable Redis instance (`REDIS_URL`, default `redis://127.0.0.1:6379/0`)
//! and are marked `#[ignore]` so the default `cargo test` run stays
//! hermetic; run with `cargo test -- --ignored` against a local Redis.

use std::sync::Arc;

use axum_test::TestServer;
use relay::cache::RelayCache;
use relay::config::{PersonaConfig, UpstreamConfig};
use relay::crypto::EnvelopeCipher;
use relay::header_capture::HeaderCapture;
use relay::kv::KvStore;
use relay::model::{AccountStore, InMemoryCollaborators, ApiKeyRecord, KeyStore, Persona, UsageSink};
use relay::orchestrator::RelayOrchestrator;
use relay::refresher::TokenRefresher;
use relay::registry::AccountRegistry;
use relay::token_counter::TokenCounter;
use relay::transport::http::AppState;
use relay::upstream::UpstreamClient;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

async fn test_server() -> TestServer {
    let kv = KvStore::connect(&redis_url()).await.expect("redis reachable for integration test");
    let cipher = EnvelopeCipher::new([3u8; 32]);
    let cache = Arc::new(RelayCache::new(60_000, 10_000, 30_000, 10_000));
    let registry = Arc::new(AccountRegistry::new(kv.clone(), cache.clone(), cipher));
    let refresher = Arc::new(TokenRefresher::new(
        kv.clone(),
        registry.clone(),
        "https://example.invalid/oauth/token".to_string(),
        "client".to_string(),
    ));

    let mut collaborators = InMemoryCollaborators::default();
    collaborators.keys.insert(
        "test-key".to_string(),
        ApiKeyRecord {
            id: "test-key".to_string(),
            display_name: "Test Key".to_string(),
            persona: Persona::Cc,
            enable_model_restriction: false,
            restricted_models: Default::default(),
            bound_account_id: None,
            client_identity_restriction: None,
        },
    );
    let collaborators = Arc::new(collaborators);

    let http = reqwest::Client::new();
    let token_counter = TokenCounter::new(http, "https://api.anthropic.com".to_string(), "2023-06-01".to_string());
    let header_capture = HeaderCapture::new(kv.clone());
    let upstream_client = UpstreamClient::new(std::time::Duration::from_secs(5));

    let orchestrator = Arc::new(RelayOrchestrator::new(
        collaborators.clone() as Arc<dyn KeyStore>,
        collaborators.clone() as Arc<dyn AccountStore>,
        collaborators as Arc<dyn UsageSink>,
        cache,
        registry,
        refresher,
        token_counter,
        header_capture,
        upstream_client,
        UpstreamConfig {
            url: "https://api.anthropic.com".to_string(),
            api_version: "2023-06-01".to_string(),
            beta_header: String::new(),
            system_prompt: None,
            oauth_token_url: "https://example.invalid/oauth/token".to_string(),
            oauth_client_id: "client".to_string(),
        },
        PersonaConfig {
            subtract_input_token_offset: true,
            input_token_offset: 14,
            databricks_org_id: 94_787_086_326_342,
            min_input_tokens: 250,
        },
        true,
    ));

    let state = Arc::new(AppState {
        orchestrator,
        started_at: 0,
    });

    let app = relay::transport::build_router(state);
    TestServer::new(app).expect("building test server")
}

#[tokio::test]
#[ignore]
async fn health_reports_ok() {
    let server = test_server().await;
    let resp = server.get("/health").await;
    resp.assert_status_ok();
    resp.assert_json_contains(&serde_json::json!({"status": "ok"}));
}

#[tokio::test]
#[ignore]
async fn key_info_requires_authorization() {
    let server = test_server().await;
    let resp = server.get("/v1/key-info").await;
    assert_eq!(resp.status_code(), 401);
}

#[tokio::test]
#[ignore]
async fn key_info_returns_persona_for_known_key() {
    let server = test_server().await;
    let resp = server
        .get("/v1/key-info")
        .add_header("authorization", "Bearer test-key")
        .await;
    resp.assert_status_ok();
    resp.assert_json_contains(&serde_json::json!({"persona": "cc"}));
}
