// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! In-process cache (C3): three independent TTL maps, bounded by size with
//! LRU-on-miss eviction, matching the `moka` dependency already present in
//! the pack's axum servers. Hit/miss counters feed `/health`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;

use crate::model::ApiKeyRecord;

#[derive(Default)]
struct HitMiss {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HitMiss {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
    fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

pub struct RelayCache {
    key_cache: Cache<String, ApiKeyRecord>,
    key_stats: HitMiss,
    dedup_cache: Cache<String, ()>,
    dedup_stats: HitMiss,
    account_list_cache: Cache<&'static str, Vec<crate::model::Account>>,
    account_list_stats: HitMiss,
}

pub struct CacheStats {
    pub key_cache: (u64, u64),
    pub dedup_cache: (u64, u64),
    pub account_list_cache: (u64, u64),
}

impl RelayCache {
    pub fn new(
        key_cache_ttl_ms: u64,
        key_cache_max: u64,
        dedup_window_ms: u64,
        dedup_max: u64,
    ) -> Self {
        Self {
            key_cache: Cache::builder()
                .max_capacity(key_cache_max)
                .time_to_live(Duration::from_millis(key_cache_ttl_ms))
                .build(),
            key_stats: HitMiss::default(),
            dedup_cache: Cache::builder()
                .max_capacity(dedup_max)
                .time_to_live(Duration::from_millis(dedup_window_ms))
                .build(),
            dedup_stats: HitMiss::default(),
            account_list_cache: Cache::builder()
                .max_capacity(4)
                .time_to_live(Duration::from_secs(60))
                .build(),
            account_list_stats: HitMiss::default(),
        }
    }

    pub async fn get_key(&self, key_id: &str) -> Option<ApiKeyRecord> {
        let hit = self.key_cache.get(key_id).await;
        if hit.is_some() {
            self.key_stats.hit();
        } else {
            self.key_stats.miss();
        }
        hit
    }

    pub async fn put_key(&self, key_id: String, record: ApiKeyRecord) {
        self.key_cache.insert(key_id, record).await;
    }

    pub async fn invalidate_key(&self, key_id: &str) {
        self.key_cache.invalidate(key_id).await;
    }

    /// Returns `true` if `fingerprint` was seen within the dedup window.
    pub async fn check_and_set_dedup(&self, fingerprint: &str) -> bool {
        if self.dedup_cache.get(fingerprint).await.is_some() {
            self.dedup_stats.hit();
            return true;
        }
        self.dedup_stats.miss();
        self.dedup_cache.insert(fingerprint.to_string(), ()).await;
        false
    }

    pub async fn get_account_list(&self) -> Option<Vec<crate::model::Account>> {
        let hit = self.account_list_cache.get("all").await;
        if hit.is_some() {
            self.account_list_stats.hit();
        } else {
            self.account_list_stats.miss();
        }
        hit
    }

    pub async fn put_account_list(&self, accounts: Vec<crate::model::Account>) {
        self.account_list_cache.insert("all", accounts).await;
    }

    pub async fn invalidate_account_list(&self) {
        self.account_list_cache.invalidate("all").await;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            key_cache: self.key_stats.snapshot(),
            dedup_cache: self.dedup_stats.snapshot(),
            account_list_cache: self.account_list_stats.snapshot(),
        }
    }
}
