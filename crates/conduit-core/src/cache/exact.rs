//! Tier 1: exact-match cache in Redis.
//!
//! Key: SHA-256 over `model::normalized_prompt`. Value: the serialized
//! response payload, with a per-entry TTL. Store outages degrade to
//! misses; they never fail the request.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value as JsonValue;

#[derive(Clone)]
pub struct ExactCache {
    connection: Option<ConnectionManager>,
    prefix: String,
    default_ttl_seconds: u64,
}

impl ExactCache {
    pub fn new(
        connection: Option<ConnectionManager>,
        prefix: impl Into<String>,
        default_ttl_seconds: u64,
    ) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            default_ttl_seconds,
        }
    }

    fn key(&self, prompt_hash: &str) -> String {
        format!("{}cache:exact:{prompt_hash}", self.prefix)
    }

    pub async fn get(&self, prompt_hash: &str) -> Option<JsonValue> {
        let connection = self.connection.as_ref()?;
        let result: Result<Option<String>, redis::RedisError> =
            connection.clone().get(self.key(prompt_hash)).await;
        match result {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(%error, "exact cache unreachable");
                None
            }
        }
    }

    pub async fn set(&self, prompt_hash: &str, payload: &JsonValue, ttl_seconds: Option<u64>) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let raw = payload.to_string();
        let result: Result<(), redis::RedisError> = connection
            .clone()
            .set_ex(self.key(prompt_hash), raw, ttl)
            .await;
        if let Err(error) = result {
            tracing::warn!(%error, "exact cache write failed");
        }
    }

    /// Wipe every exact entry under this prefix. Entries are hash-keyed, so
    /// a per-model clear still wipes the whole tier.
    pub async fn clear(&self) -> u64 {
        let Some(connection) = self.connection.as_ref() else {
            return 0;
        };
        let mut connection = connection.clone();
        let pattern = format!("{}cache:exact:*", self.prefix);

        let mut removed = 0u64;
        let mut cursor = 0u64;
        loop {
            let scanned: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut connection)
                .await;
            let (next, keys) = match scanned {
                Ok(page) => page,
                Err(error) => {
                    tracing::warn!(%error, "exact cache clear aborted");
                    break;
                }
            };
            if !keys.is_empty() {
                let deleted: Result<u64, redis::RedisError> =
                    connection.del(keys).await;
                removed += deleted.unwrap_or(0);
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        removed
    }
}
