// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Selector (C6): per-request account choice (bound / sticky / LRU /
//! degraded), and the session-hash projection described in §4.6 / §9.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::RelayError;
use crate::model::{Account, ApiKeyRecord, BindingMode};
use crate::registry::AccountRegistry;

/// §9: hash {api-key-id, model, first-user-turn-content}, not the raw api
/// key bytes, so two tenants sending identical first turns never collide.
pub fn session_hash(key_id: &str, model: &str, first_user_turn: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(first_user_turn.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Selector {
    registry: Arc<AccountRegistry>,
}

impl Selector {
    pub fn new(registry: Arc<AccountRegistry>) -> Self {
        Self { registry }
    }

    pub async fn select(
        &self,
        key: &ApiKeyRecord,
        session_hash: Option<&str>,
    ) -> Result<Account, RelayError> {
        // 1. Bound account, if not rate-limited and not broken.
        if let Some(bound_id) = &key.bound_account_id {
            if let Some(bound) = self.registry.get(bound_id).await? {
                if bound.last_refresh_error.is_none() && !self.registry.is_rate_limited(&bound.id).await? {
                    self.record_selection(&bound, session_hash).await?;
                    return Ok(bound);
                }
                // Bound but limited/broken: §9 decision — fall through to shared pool.
            }
        }

        // 2. Sticky mapping.
        if let Some(hash) = session_hash {
            if let Some(account_id) = self.registry.read_sticky(hash).await? {
                if let Some(account) = self.registry.get(&account_id).await? {
                    if account.last_refresh_error.is_none() && !self.registry.is_rate_limited(&account.id).await? {
                        self.registry.write_sticky(hash, &account.id).await?;
                        self.registry.touch_last_used(&account.id).await?;
                        return Ok(account);
                    }
                }
            }
        }

        // 3. Partition shared accounts. A broken account (failed refresh)
        // is excluded entirely rather than falling into `limited`: it has
        // no recovery timer, so the degraded path has no reason to prefer
        // it over a merely rate-limited one.
        let all = self.registry.list_all().await?;
        let mut available = Vec::new();
        let mut limited = Vec::new();
        for account in all {
            if !account.active || account.binding_mode != BindingMode::Shared {
                continue;
            }
            if account.last_refresh_error.is_some() {
                continue;
            }
            if self.registry.is_rate_limited(&account.id).await? {
                limited.push(account);
            } else {
                available.push(account);
            }
        }

        // 4. LRU among available, ties broken by id.
        if let Some(chosen) = available
            .into_iter()
            .min_by(|a, b| a.last_used_at.cmp(&b.last_used_at).then_with(|| a.id.cmp(&b.id)))
        {
            self.record_selection(&chosen, session_hash).await?;
            return Ok(chosen);
        }

        // 5. Degraded path: every candidate limited, pick closest to recovery.
        if let Some(chosen) = limited.into_iter().min_by(|a, b| {
            a.rate_limited_at
                .unwrap_or(u64::MAX)
                .cmp(&b.rate_limited_at.unwrap_or(u64::MAX))
                .then_with(|| a.id.cmp(&b.id))
        }) {
            tracing::warn!(account_id = %chosen.id, "selector: all shared accounts rate-limited, degraded selection");
            self.record_selection(&chosen, session_hash).await?;
            return Ok(chosen);
        }

        Err(RelayError::Config("no accounts configured".into()))
    }

    async fn record_selection(
        &self,
        account: &Account,
        session_hash: Option<&str>,
    ) -> Result<(), RelayError> {
        if let Some(hash) = session_hash {
            self.registry.write_sticky(hash, &account.id).await?;
        }
        self.registry.touch_last_used(&account.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_hash_is_stable_and_tenant_scoped() {
        let a = session_hash("key-1", "claude-sonnet-4", "hello there");
        let b = session_hash("key-1", "claude-sonnet-4", "hello there");
        let c = session_hash("key-2", "claude-sonnet-4", "hello there");
        assert_eq!(a, b);
        assert_ne!(a, c, "identical first turns across tenants must not collide");
    }
}
