//! Two-tier response cache: exact hash fast path, vector-similarity slow
//! path. A semantic hit promotes its entry into the exact tier so the next
//! identical prompt is an O(1) lookup.

pub mod embedding;
pub mod exact;

use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use conduit_common::config::CacheSettings;
use conduit_protocol::openai::{ChatCompletionResponse, ChatMessage, MessageRole};
use conduit_storage::ConduitStorage;
use conduit_storage::entities::cache_entries;

use crate::cost::{PricingTable, calculate_cost};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Exact,
    Semantic,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: ChatCompletionResponse,
    pub source: CacheSource,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_entries: u64,
    pub active_entries: u64,
    pub expired_entries: u64,
    pub total_hits: i64,
    pub total_cost_saved_usd: Decimal,
}

/// Flatten a conversation to the newline-joined `"{role}: {text}"` form
/// used for both the hash key and the embedding. System messages are
/// stable per application and excluded so they do not partition the cache.
pub fn normalize_prompt(messages: &[ChatMessage]) -> String {
    let mut lines = Vec::new();
    for message in messages {
        if message.role == MessageRole::System {
            continue;
        }
        for fragment in message.text_fragments() {
            lines.push(format!("{}: {fragment}", message.role.as_str()));
        }
    }
    lines.join("\n")
}

pub fn prompt_hash(model: &str, normalized: &str) -> String {
    hex::encode(Sha256::digest(format!("{model}::{normalized}").as_bytes()))
}

pub struct CacheManager {
    settings: CacheSettings,
    exact: exact::ExactCache,
    storage: ConduitStorage,
    pricing: std::sync::Arc<PricingTable>,
}

impl CacheManager {
    pub fn new(
        settings: CacheSettings,
        exact: exact::ExactCache,
        storage: ConduitStorage,
        pricing: std::sync::Arc<PricingTable>,
    ) -> Self {
        Self {
            settings,
            exact,
            storage,
            pricing,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Tier 1 then tier 2. Any failure inside the semantic tier is logged
    /// and treated as a miss.
    pub async fn lookup(&self, messages: &[ChatMessage], model: &str) -> Option<CacheHit> {
        if !self.settings.enabled {
            return None;
        }
        let normalized = normalize_prompt(messages);
        if normalized.trim().is_empty() {
            return None;
        }
        let hash = prompt_hash(model, &normalized);

        if let Some(payload) = self.exact.get(&hash).await
            && let Ok(response) = serde_json::from_value::<ChatCompletionResponse>(payload)
        {
            tracing::info!(model, source = "exact", "cache hit");
            return Some(CacheHit {
                response,
                source: CacheSource::Exact,
                similarity: 1.0,
            });
        }

        match self.semantic_lookup(&normalized, &hash, model).await {
            Ok(hit) => hit,
            Err(error) => {
                tracing::warn!(model, error, "semantic cache lookup failed");
                None
            }
        }
    }

    async fn semantic_lookup(
        &self,
        normalized: &str,
        hash: &str,
        model: &str,
    ) -> Result<Option<CacheHit>, String> {
        let vector =
            embedding::embed_text(&self.settings.embedding_model, normalized.to_string()).await?;
        let now = OffsetDateTime::now_utc();
        let candidates = self
            .storage
            .live_cache_entries(model, now)
            .await
            .map_err(|err| err.to_string())?;

        // Cosine distance ascending, best candidate only.
        let mut ranked: Vec<(f32, cache_entries::Model)> = Vec::new();
        for entry in candidates {
            let stored: Vec<f32> = match serde_json::from_value(entry.prompt_embedding.clone()) {
                Ok(stored) => stored,
                Err(_) => continue,
            };
            ranked.push((embedding::cosine_distance(&vector, &stored), entry));
        }
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        let Some((distance, entry)) = ranked.into_iter().next() else {
            return Ok(None);
        };
        let similarity = 1.0 - distance;
        if similarity < self.settings.semantic_threshold {
            return Ok(None);
        }

        let response: ChatCompletionResponse =
            serde_json::from_value(entry.response_payload.clone())
                .map_err(|err| err.to_string())?;

        // Bookkeeping and tier-1 promotion; both best-effort.
        let saved = calculate_cost(
            &self.pricing,
            model,
            i64::from(entry.prompt_tokens),
            i64::from(entry.completion_tokens),
        );
        if let Err(error) = self.storage.record_cache_hit(entry.id, saved).await {
            tracing::warn!(%error, "cache hit bookkeeping failed");
        }
        self.exact.set(hash, &entry.response_payload, None).await;

        tracing::info!(model, source = "semantic", similarity, "cache hit");
        Ok(Some(CacheHit {
            response,
            source: CacheSource::Semantic,
            similarity,
        }))
    }

    /// Write both tiers after a successful upstream response. Failures are
    /// logged and swallowed.
    pub async fn store(
        &self,
        messages: &[ChatMessage],
        model: &str,
        response: &ChatCompletionResponse,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) {
        if !self.settings.enabled {
            return;
        }
        let normalized = normalize_prompt(messages);
        if normalized.trim().is_empty() {
            return;
        }
        let hash = prompt_hash(model, &normalized);
        let payload = match serde_json::to_value(response) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "cache store skipped: unserializable response");
                return;
            }
        };

        self.exact.set(&hash, &payload, None).await;

        let vector = match embedding::embed_text(&self.settings.embedding_model, normalized.clone())
            .await
        {
            Ok(vector) => vector,
            Err(error) => {
                tracing::warn!(error, "cache store skipped semantic tier");
                return;
            }
        };
        let now = OffsetDateTime::now_utc();
        let entry = cache_entries::Model {
            id: Uuid::new_v4(),
            prompt_hash: hash,
            prompt_embedding: JsonValue::from(vector),
            model: model.to_string(),
            prompt_text: normalized,
            response_payload: payload,
            prompt_tokens: prompt_tokens as i32,
            completion_tokens: completion_tokens as i32,
            hit_count: 0,
            cost_saved_usd: Decimal::ZERO,
            created_at: now,
            expires_at: now + Duration::seconds(self.settings.exact_ttl_seconds as i64),
        };
        if let Err(error) = self.storage.insert_cache_entry(entry).await {
            tracing::warn!(%error, "semantic cache write failed");
        }
    }

    /// Wipe matching entries from both tiers.
    pub async fn clear(&self, model: Option<&str>) -> (u64, u64) {
        let exact_cleared = self.exact.clear().await;
        let semantic_cleared = self
            .storage
            .delete_cache_entries(model)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(%error, "semantic cache clear failed");
                0
            });
        (exact_cleared, semantic_cleared)
    }

    pub async fn stats(&self) -> CacheStats {
        let now = OffsetDateTime::now_utc();
        match self.storage.cache_table_stats(now).await {
            Ok(stats) => CacheStats {
                total_entries: stats.total_entries,
                active_entries: stats.active_entries,
                expired_entries: stats.expired_entries,
                total_hits: stats.total_hits,
                total_cost_saved_usd: stats.total_cost_saved_usd,
            },
            Err(error) => {
                tracing::warn!(%error, "cache stats unavailable");
                CacheStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::openai::{ContentPart, MessageContent};

    #[test]
    fn normalization_skips_system_messages() {
        let messages = vec![
            ChatMessage::system("You are helpful"),
            ChatMessage::user("What is 2+2?"),
            ChatMessage::assistant("4"),
        ];
        assert_eq!(normalize_prompt(&messages), "user: What is 2+2?\nassistant: 4");
    }

    #[test]
    fn normalization_is_stable_across_content_shapes() {
        let plain = vec![ChatMessage::user("What is 2+2?")];
        let parts = vec![ChatMessage {
            role: MessageRole::User,
            content: Some(MessageContent::Parts(vec![ContentPart::Text {
                text: "What is 2+2?".into(),
            }])),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }];
        assert_eq!(normalize_prompt(&plain), normalize_prompt(&parts));
    }

    #[test]
    fn hash_is_keyed_by_model_and_prompt() {
        let normalized = "user: What is 2+2?";
        let a = prompt_hash("gpt-4o", normalized);
        assert_eq!(a, prompt_hash("gpt-4o", normalized));
        assert_ne!(a, prompt_hash("gpt-4o-mini", normalized));
        assert_ne!(a, prompt_hash("gpt-4o", "user: What is 3+3?"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn equivalent_prompts_share_a_key_regardless_of_system() {
        let with_system = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("What is 2+2?"),
        ];
        let without = vec![ChatMessage::user("What is 2+2?")];
        assert_eq!(
            prompt_hash("gpt-4o", &normalize_prompt(&with_system)),
            prompt_hash("gpt-4o", &normalize_prompt(&without))
        );
    }
}
