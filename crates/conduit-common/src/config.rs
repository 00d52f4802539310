use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("unreadable config file {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Invalid {
        path: String,
        source: Box<toml::de::Error>,
    },
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order (lowest to highest): built-in defaults, config file,
/// environment / CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    /// Prefix applied to every Redis key this process owns.
    pub redis_key_prefix: String,
    /// Master admin secret; an empty value disables ambient admin access.
    pub master_key: String,
    /// Secret and salt used to derive the credential encryption key.
    pub encryption_key: String,
    pub encryption_salt: String,
    pub log_filter: String,
    pub pricing_path: Option<PathBuf>,
    pub routing: RoutingSettings,
    pub cache: CacheSettings,
    pub guardrails: GuardrailSettings,
    pub breaker: BreakerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    pub strategy: String,
    /// Fallback chain length is `max_retries + 1`.
    pub max_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub exact_ttl_seconds: u64,
    pub semantic_threshold: f32,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailSettings {
    pub enabled: bool,
    pub max_input_length: usize,
    pub pii_enabled: bool,
    /// Applied to PII findings unless a stored rule overrides it.
    pub pii_default_action: String,
    pub injection_enabled: bool,
    pub injection_threshold: f64,
    pub content_filter_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: i32,
    pub cooldown_seconds: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8580,
            database_url: "sqlite://conduit.db?mode=rwc".to_string(),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            redis_key_prefix: "conduit:".to_string(),
            master_key: String::new(),
            encryption_key: "conduit-dev-encryption-key".to_string(),
            encryption_salt: "conduit-salt".to_string(),
            log_filter: "info".to_string(),
            pricing_path: None,
            routing: RoutingSettings {
                strategy: "priority".to_string(),
                max_retries: 2,
            },
            cache: CacheSettings {
                enabled: true,
                exact_ttl_seconds: 3600,
                semantic_threshold: 0.95,
                embedding_model: "BAAI/bge-small-en-v1.5".to_string(),
            },
            guardrails: GuardrailSettings {
                enabled: true,
                max_input_length: 100_000,
                pii_enabled: true,
                pii_default_action: "redact".to_string(),
                injection_enabled: true,
                injection_threshold: 0.70,
                content_filter_enabled: true,
            },
            breaker: BreakerSettings {
                failure_threshold: 3,
                cooldown_seconds: 60,
            },
        }
    }
}

/// Optional layer used when merging configuration sources.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_key_prefix: Option<String>,
    pub master_key: Option<String>,
    pub encryption_key: Option<String>,
    pub encryption_salt: Option<String>,
    pub log_filter: Option<String>,
    pub pricing_path: Option<PathBuf>,
    pub routing: Option<RoutingPatch>,
    pub cache: Option<CachePatch>,
    pub guardrails: Option<GuardrailPatch>,
    pub breaker: Option<BreakerPatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingPatch {
    pub strategy: Option<String>,
    pub max_retries: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CachePatch {
    pub enabled: Option<bool>,
    pub exact_ttl_seconds: Option<u64>,
    pub semantic_threshold: Option<f32>,
    pub embedding_model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardrailPatch {
    pub enabled: Option<bool>,
    pub max_input_length: Option<usize>,
    pub pii_enabled: Option<bool>,
    pub pii_default_action: Option<String>,
    pub injection_enabled: Option<bool>,
    pub injection_threshold: Option<f64>,
    pub content_filter_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerPatch {
    pub failure_threshold: Option<i32>,
    pub cooldown_seconds: Option<i64>,
}

impl ConfigPatch {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Invalid {
            path: path.display().to_string(),
            source: Box::new(source),
        })
    }
}

macro_rules! apply {
    ($target:expr, $patch:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $target.$field = value;
            }
        )+
    };
}

impl GatewayConfig {
    /// Overlay a patch onto this config; present fields win.
    pub fn apply(&mut self, patch: ConfigPatch) {
        apply!(
            self, patch, host, port, database_url, redis_url, redis_key_prefix, master_key,
            encryption_key, encryption_salt, log_filter,
        );
        if patch.pricing_path.is_some() {
            self.pricing_path = patch.pricing_path;
        }
        if let Some(routing) = patch.routing {
            apply!(self.routing, routing, strategy, max_retries);
        }
        if let Some(cache) = patch.cache {
            apply!(
                self.cache, cache, enabled, exact_ttl_seconds, semantic_threshold, embedding_model,
            );
        }
        if let Some(guardrails) = patch.guardrails {
            apply!(
                self.guardrails,
                guardrails,
                enabled,
                max_input_length,
                pii_enabled,
                pii_default_action,
                injection_enabled,
                injection_threshold,
                content_filter_enabled,
            );
        }
        if let Some(breaker) = patch.breaker {
            apply!(self.breaker, breaker, failure_threshold, cooldown_seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overrides_only_present_fields() {
        let mut config = GatewayConfig::default();
        config.apply(ConfigPatch {
            port: Some(9000),
            cache: Some(CachePatch {
                semantic_threshold: Some(0.9),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert!((config.cache.semantic_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.cache.exact_ttl_seconds, 3600);
    }

    #[test]
    fn patch_parses_from_toml() {
        let patch: ConfigPatch = toml::from_str(
            r#"
            port = 8080
            master_key = "super-secret"

            [guardrails]
            injection_threshold = 0.5
            "#,
        )
        .unwrap();
        let mut config = GatewayConfig::default();
        config.apply(patch);
        assert_eq!(config.port, 8080);
        assert_eq!(config.master_key, "super-secret");
        assert!((config.guardrails.injection_threshold - 0.5).abs() < f64::EPSILON);
    }
}
