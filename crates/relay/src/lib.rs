// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Multi-tenant reverse proxy in front of the Anthropic Messages API.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod header_capture;
pub mod kv;
pub mod model;
pub mod orchestrator;
pub mod refresher;
pub mod registry;
pub mod selector;
pub mod shaper;
pub mod token_counter;
pub mod transport;
pub mod upstream;
pub mod util;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::RelayCache;
use crate::config::RelayConfig;
use crate::crypto::EnvelopeCipher;
use crate::header_capture::HeaderCapture;
use crate::kv::KvStore;
use crate::model::{AccountStore, InMemoryCollaborators, KeyStore, UsageSink};
use crate::orchestrator::RelayOrchestrator;
use crate::refresher::TokenRefresher;
use crate::registry::AccountRegistry;
use crate::token_counter::TokenCounter;
use crate::transport::http::AppState;
use crate::upstream::UpstreamClient;
use crate::util::epoch_ms;

/// Runs the relay until `shutdown` fires, against an in-memory
/// [`InMemoryCollaborators`] for the `KeyStore`/`AccountStore`/`UsageSink`
/// boundary (§1). This is what `relayd --dev` and the test binary use;
/// a real deployment should call [`run_with_collaborators`] with its own
/// database-backed stores instead.
pub async fn run(config: RelayConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let collaborators = Arc::new(InMemoryCollaborators::default());
    run_with_collaborators(
        config,
        shutdown,
        collaborators.clone(),
        collaborators.clone(),
        collaborators,
    )
    .await
}

/// Runs the relay until `shutdown` fires, against caller-supplied
/// collaborators. Production callers pass their own `KeyStore` (persistent
/// key CRUD), `AccountStore` (price-table), and `UsageSink` (billing
/// pipeline) implementations here — the three are independent trait
/// objects, not bundled behind one concrete type, so a deployment can mix
/// and match (e.g. a database-backed `KeyStore` with an in-memory
/// `UsageSink` during a migration).
pub async fn run_with_collaborators(
    mut config: RelayConfig,
    shutdown: CancellationToken,
    keys: Arc<dyn KeyStore>,
    accounts: Arc<dyn AccountStore>,
    usage: Arc<dyn UsageSink>,
) -> anyhow::Result<()> {
    config.apply_config_file_overlay()?;
    let kv = KvStore::connect(&config.kv.redis_url()).await?;
    let cipher = EnvelopeCipher::new(config.encryption_key_bytes()?);
    let cache = Arc::new(RelayCache::new(
        config.performance.key_cache_ttl_ms,
        config.performance.key_cache_max,
        config.performance.dedup_window_ms,
        config.performance.dedup_max,
    ));
    let registry = Arc::new(AccountRegistry::new(kv.clone(), cache.clone(), cipher));
    let refresher = Arc::new(TokenRefresher::new(
        kv.clone(),
        registry.clone(),
        config.upstream.oauth_token_url.clone(),
        config.upstream.oauth_client_id.clone(),
    ));

    {
        let refresher = refresher.clone();
        let interval = Duration::from_millis(config.performance.token_refresh_sweep_ms);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = refresher.run_sweep_forever(interval) => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }

    let http_client = reqwest::Client::builder()
        .timeout(config.proxy.timeout())
        .build()?;
    let token_counter = TokenCounter::new(
        http_client.clone(),
        config.upstream.url.clone(),
        config.upstream.api_version.clone(),
    );
    let header_capture = HeaderCapture::new(kv.clone());
    let upstream_client = UpstreamClient::new(config.proxy.timeout());

    let orchestrator = Arc::new(RelayOrchestrator::new(
        keys,
        accounts,
        usage,
        cache,
        registry,
        refresher,
        token_counter,
        header_capture,
        upstream_client,
        config.upstream.clone(),
        config.personas.clone(),
        config.performance.dedup_enabled,
    ));

    let state = Arc::new(AppState {
        orchestrator,
        started_at: epoch_ms(),
    });

    let app = transport::build_router(state);
    let listener = TcpListener::bind(config.bind_addr()).await?;
    tracing::info!(addr = %config.bind_addr(), "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
