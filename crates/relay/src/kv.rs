// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Typed KV store adapter (C1). Backed by `redis::aio::ConnectionManager`,
//! which reconnects transparently and is cheap to clone, the way the pack's
//! Redis client wrappers hold a single shared manager per process.

use std::collections::HashMap;

use redis::AsyncCommands;

use crate::error::RelayError;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct KvStore {
    manager: redis::aio::ConnectionManager,
}

impl KvStore {
    pub async fn connect(redis_url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| RelayError::KvUnavailable(format!("invalid redis url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| RelayError::KvUnavailable(format!("connecting to redis: {e}")))?;
        Ok(Self { manager })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.manager.clone()
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RelayError> {
        self.conn()
            .get(key)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), RelayError> {
        self.conn()
            .set(key, value)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), RelayError> {
        self.conn()
            .set_ex(key, value, ttl_secs)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))
    }

    pub async fn del(&self, key: &str) -> Result<(), RelayError> {
        let _: i64 = self
            .conn()
            .del(key)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), RelayError> {
        let _: bool = self
            .conn()
            .expire(key, ttl_secs as i64)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, RelayError> {
        self.conn()
            .hgetall(key)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))
    }

    pub async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(&str, &str)],
    ) -> Result<(), RelayError> {
        self.conn()
            .hset_multiple(key, fields)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), RelayError> {
        let _: i64 = self
            .conn()
            .hset(key, field, value)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, RelayError> {
        self.conn()
            .keys(pattern)
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))
    }

    /// Atomic set-if-absent with a TTL, used to acquire locks and sticky
    /// mappings. Returns `true` iff this caller won the race.
    pub async fn acquire(&self, key: &str, holder_token: &str, ttl_secs: u64) -> Result<bool, RelayError> {
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder_token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))?;
        Ok(result.is_some())
    }

    /// Releases `key` only if its current value equals `holder_token`
    /// (compare-and-delete via a Lua script, so a stale holder can never
    /// clobber a newer lock acquired after its own TTL expired).
    pub async fn release(&self, key: &str, holder_token: &str) -> Result<bool, RelayError> {
        let result: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(holder_token)
            .invoke_async(&mut self.conn())
            .await
            .map_err(|e| RelayError::KvUnavailable(e.to_string()))?;
        Ok(result == 1)
    }
}
