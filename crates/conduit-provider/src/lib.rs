pub mod anthropic;
pub mod client;
pub mod google;
pub mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value as JsonValue;

use conduit_common::GatewayError;
use conduit_protocol::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;

/// A resolved upstream destination: one deployment with its credential
/// already decrypted by the caller.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub deployment_name: String,
    pub model: String,
    pub api_base: String,
    pub api_key: String,
}

/// Outcome of translating an OpenAI-shaped request into a provider dialect.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: JsonValue,
}

pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, ProviderFailure>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderFailure {
    #[error("{provider} authentication failed for deployment '{deployment}'")]
    AuthFailed {
        provider: &'static str,
        deployment: String,
    },
    #[error("{provider} rate limit exceeded on deployment '{deployment}'")]
    RateLimited {
        provider: &'static str,
        deployment: String,
    },
    #[error("{provider} returned {status} for deployment '{deployment}': {detail}")]
    UpstreamStatus {
        provider: &'static str,
        deployment: String,
        status: u16,
        detail: String,
    },
    #[error("{provider} request failed for deployment '{deployment}': {message}")]
    Transport {
        provider: &'static str,
        deployment: String,
        message: String,
    },
    #[error("{provider} response could not be decoded for deployment '{deployment}': {message}")]
    Decode {
        provider: &'static str,
        deployment: String,
        message: String,
    },
}

impl ProviderFailure {
    pub fn provider(&self) -> &'static str {
        match self {
            Self::AuthFailed { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::UpstreamStatus { provider, .. }
            | Self::Transport { provider, .. }
            | Self::Decode { provider, .. } => provider,
        }
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::AuthFailed { .. } => Some(401),
            Self::RateLimited { .. } => Some(429),
            Self::UpstreamStatus { status, .. } => Some(*status),
            Self::Transport { .. } | Self::Decode { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transport { .. })
    }

    pub fn into_gateway_error(self) -> GatewayError {
        GatewayError::Provider {
            message: self.to_string(),
            provider: self.provider().to_string(),
            status: self.upstream_status(),
            retryable: self.is_retryable(),
        }
    }
}

/// One upstream dialect. All operations take and return OpenAI-shaped
/// types; everything provider-specific stays behind this trait.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Translate to `(url, headers, body)` without sending anything.
    fn transform_request(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
        stream: bool,
    ) -> TransformedRequest;

    async fn send(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
    ) -> Result<ChatCompletionResponse, ProviderFailure>;

    /// Open a streaming completion. Resolves only after the upstream has
    /// accepted the request, so a returned stream means the fallback window
    /// has closed.
    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
    ) -> Result<ChunkStream, ProviderFailure>;
}

/// Adapter lookup by the deployment's provider tag.
pub trait AdapterSet: Send + Sync {
    fn adapter(&self, provider: &str) -> Option<&dyn ProviderAdapter>;
}

#[derive(Default)]
pub struct AdapterRegistry {
    openai: OpenAiAdapter,
    anthropic: AnthropicAdapter,
    google: GoogleAdapter,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdapterSet for AdapterRegistry {
    fn adapter(&self, provider: &str) -> Option<&dyn ProviderAdapter> {
        match provider {
            "openai" => Some(&self.openai),
            "anthropic" => Some(&self.anthropic),
            "google" => Some(&self.google),
            _ => None,
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn completion_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..24])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatches_on_provider_tag() {
        let registry = AdapterRegistry::new();
        assert_eq!(registry.adapter("openai").unwrap().name(), "openai");
        assert_eq!(registry.adapter("anthropic").unwrap().name(), "anthropic");
        assert_eq!(registry.adapter("google").unwrap().name(), "google");
        assert!(registry.adapter("bedrock").is_none());
    }

    #[test]
    fn failure_status_and_retry_mapping() {
        let auth = ProviderFailure::AuthFailed {
            provider: "openai",
            deployment: "d".into(),
        };
        assert_eq!(auth.upstream_status(), Some(401));
        assert!(!auth.is_retryable());

        let limited = ProviderFailure::RateLimited {
            provider: "openai",
            deployment: "d".into(),
        };
        assert!(limited.is_retryable());

        let transport = ProviderFailure::Transport {
            provider: "google",
            deployment: "d".into(),
            message: "connect timeout".into(),
        };
        assert!(transport.is_retryable());
        assert_eq!(transport.upstream_status(), None);

        let err = transport.into_gateway_error();
        assert_eq!(err.kind(), "provider_error");
        assert_eq!(err.status().as_u16(), 502);
    }
}
