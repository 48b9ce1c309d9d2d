// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
//! Header capture (C11): per-account storage of genuine Claude-Code
//! headers, consulted by the upstream client (C9) to synthesize a plausible
//! fingerprint on later non-genuine calls.

use crate::error::RelayError;
use crate::kv::KvStore;
use crate::model::HeaderSnapshot;

/// Headers never captured or replayed — credentials and per-hop framing.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "authorization",
    "x-api-key",
    "proxy-authorization",
    "content-encoding",
    "transfer-encoding",
];

fn snapshot_key(account_id: &str) -> String {
    format!("header_snapshot:{account_id}")
}

pub struct HeaderCapture {
    kv: KvStore,
}

impl HeaderCapture {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Called when a 2xx response is received for a request that was
    /// genuine Claude-Code. Overwrites any prior snapshot for the account.
    pub async fn capture(
        &self,
        account_id: &str,
        headers: &[(String, String)],
    ) -> Result<(), RelayError> {
        let filtered: Vec<(String, String)> = headers
            .iter()
            .filter(|(k, _)| !SENSITIVE_HEADERS.contains(&k.to_ascii_lowercase().as_str()))
            .cloned()
            .collect();
        let snapshot = HeaderSnapshot { headers: filtered };
        let json = serde_json::to_string(&snapshot)
            .map_err(|e| RelayError::Config(format!("serializing header snapshot: {e}")))?;
        self.kv.set(&snapshot_key(account_id), &json).await
    }

    pub async fn get(&self, account_id: &str) -> Result<Option<HeaderSnapshot>, RelayError> {
        let Some(json) = self.kv.get(&snapshot_key(account_id)).await? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&json)
            .map_err(|e| RelayError::Config(format!("corrupt header snapshot: {e}")))?;
        Ok(Some(snapshot))
    }
}
