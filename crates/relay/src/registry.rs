// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Account registry (C4): read-through list of upstream accounts, rate-limit
//! state machine, sticky-session map. Durable state lives in the KV store
//! (`claude_account:<id>` hashes, §6); `RelayCache` supplies the read-through
//! snapshot for `list_all`.

use std::sync::Arc;

use crate::cache::RelayCache;
use crate::crypto::{Envelope, EnvelopeCipher};
use crate::error::RelayError;
use crate::kv::KvStore;
use crate::model::{Account, BindingMode, OAuthBlob, ProxyConfigRef, RateLimitStatus};
use crate::util::epoch_ms;

const RATE_LIMIT_RECOVERY_MS: u64 = 3_600_000;

pub struct AccountRegistry {
    kv: KvStore,
    cache: Arc<RelayCache>,
    cipher: EnvelopeCipher,
}

fn account_key(id: &str) -> String {
    format!("claude_account:{id}")
}

fn sticky_key(session_hash: &str) -> String {
    format!("session_mapping:{session_hash}")
}

impl AccountRegistry {
    pub fn new(kv: KvStore, cache: Arc<RelayCache>, cipher: EnvelopeCipher) -> Self {
        Self { kv, cache, cipher }
    }

    pub async fn list_all(&self) -> Result<Vec<Account>, RelayError> {
        if let Some(cached) = self.cache.get_account_list().await {
            return Ok(cached);
        }
        let keys = self.kv.keys("claude_account:*").await?;
        let mut accounts = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.trim_start_matches("claude_account:");
            if let Some(account) = self.get(id).await? {
                accounts.push(account);
            }
        }
        self.cache.put_account_list(accounts.clone()).await;
        Ok(accounts)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Account>, RelayError> {
        let fields = self.kv.hgetall(&account_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.decode(id, &fields)?))
    }

    fn decode(
        &self,
        id: &str,
        fields: &std::collections::HashMap<String, String>,
    ) -> Result<Account, RelayError> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let envelope = Envelope {
            ciphertext: get("oauth_ciphertext"),
            iv: get("oauth_iv"),
        };
        let oauth_json = self.cipher.decrypt_string(&envelope)?;
        let oauth: OAuthBlob = serde_json::from_str(&oauth_json)
            .map_err(|e| RelayError::Crypto(format!("corrupt oauth blob for {id}: {e}")))?;

        let proxy = fields
            .get("proxy")
            .filter(|s| !s.is_empty())
            .map(|s| serde_json::from_str::<ProxyConfigRef>(s))
            .transpose()
            .map_err(|e| RelayError::Config(format!("corrupt proxy config for {id}: {e}")))?;

        let status = if get("status") == "limited" {
            RateLimitStatus::Limited
        } else {
            RateLimitStatus::Unlimited
        };
        let binding_mode = if get("binding_mode") == "dedicated" {
            BindingMode::Dedicated
        } else {
            BindingMode::Shared
        };

        Ok(Account {
            id: id.to_string(),
            name: get("name"),
            active: get("active") != "false",
            proxy,
            oauth,
            last_used_at: get("last_used_at").parse().unwrap_or(0),
            last_refresh_at: get("last_refresh_at").parse().unwrap_or(0),
            rate_limited_at: fields.get("rate_limited_at").and_then(|s| s.parse().ok()),
            status,
            binding_mode,
            last_refresh_error: fields.get("last_refresh_error").filter(|s| !s.is_empty()).cloned(),
        })
    }

    pub async fn update_oauth(&self, id: &str, oauth: &OAuthBlob) -> Result<(), RelayError> {
        let json = serde_json::to_string(oauth)
            .map_err(|e| RelayError::Config(format!("serializing oauth blob: {e}")))?;
        let envelope = self.cipher.encrypt_str(&json)?;
        self.kv
            .hset_multiple(
                &account_key(id),
                &[
                    ("oauth_ciphertext", envelope.ciphertext.as_str()),
                    ("oauth_iv", envelope.iv.as_str()),
                    ("last_refresh_at", epoch_ms().to_string().as_str()),
                    ("last_refresh_error", ""),
                ],
            )
            .await?;
        self.cache.invalidate_account_list().await;
        Ok(())
    }

    /// §4.5 step 3: a failed refresh marks the account instead of leaving it
    /// looking healthy; the selector skips any account carrying this field.
    pub async fn mark_refresh_error(&self, id: &str, message: &str) -> Result<(), RelayError> {
        self.kv
            .hset_multiple(&account_key(id), &[("last_refresh_error", message)])
            .await?;
        self.cache.invalidate_account_list().await;
        Ok(())
    }

    pub async fn touch_last_used(&self, id: &str) -> Result<(), RelayError> {
        self.kv
            .hset(&account_key(id), "last_used_at", epoch_ms().to_string().as_str())
            .await?;
        self.cache.invalidate_account_list().await;
        Ok(())
    }

    /// §4.4: sets `rate_limited_at = now`, `status = "limited"`, and — if a
    /// session hash is provided — evicts the sticky mapping.
    pub async fn mark_rate_limited(
        &self,
        id: &str,
        session_hash: Option<&str>,
    ) -> Result<(), RelayError> {
        let now = epoch_ms();
        self.kv
            .hset_multiple(
                &account_key(id),
                &[
                    ("status", "limited"),
                    ("rate_limited_at", now.to_string().as_str()),
                ],
            )
            .await?;
        if let Some(hash) = session_hash {
            self.kv.del(&sticky_key(hash)).await?;
        }
        self.cache.invalidate_account_list().await;
        Ok(())
    }

    /// Idempotent; also called opportunistically on any 2xx response.
    pub async fn clear_rate_limit(&self, id: &str) -> Result<(), RelayError> {
        self.kv
            .hset_multiple(&account_key(id), &[("status", "unlimited")])
            .await?;
        self.cache.invalidate_account_list().await;
        Ok(())
    }

    /// Additionally auto-clears the stored flag when the 1h recovery window
    /// has elapsed, so a stale "limited" row does not linger forever.
    pub async fn is_rate_limited(&self, id: &str) -> Result<bool, RelayError> {
        let Some(account) = self.get(id).await? else {
            return Ok(false);
        };
        if account.status == RateLimitStatus::Limited {
            if let Some(at) = account.rate_limited_at {
                if epoch_ms().saturating_sub(at) >= RATE_LIMIT_RECOVERY_MS {
                    self.clear_rate_limit(id).await?;
                    return Ok(false);
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn write_sticky(&self, session_hash: &str, account_id: &str) -> Result<(), RelayError> {
        self.kv.set_ex(&sticky_key(session_hash), account_id, 3600).await
    }

    pub async fn read_sticky(&self, session_hash: &str) -> Result<Option<String>, RelayError> {
        self.kv.get(&sticky_key(session_hash)).await
    }
}
