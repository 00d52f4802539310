use http::StatusCode;
use serde_json::{Value as JsonValue, json};

/// Gateway error taxonomy. Every variant knows its wire status and renders
/// an OpenAI-style `{"error": {...}}` body so existing SDKs can parse it.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    MissingCredentials(String),
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("{0}")]
    ExpiredCredentials(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    RateLimited { message: String, retry_after: i64 },
    #[error("{0}")]
    BudgetExceeded(String),
    #[error("{message}")]
    Validation { message: String, details: JsonValue },
    #[error("{message}")]
    Provider {
        message: String,
        provider: String,
        status: Option<u16>,
        retryable: bool,
    },
    #[error("{0}")]
    NoHealthyDeployment(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: JsonValue::Null,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredentials(_) | Self::InvalidCredentials(_) | Self::ExpiredCredentials(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } | Self::BudgetExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            Self::NoHealthyDeployment(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials(_) => "missing_credentials",
            Self::InvalidCredentials(_) => "invalid_credentials",
            Self::ExpiredCredentials(_) => "expired_credentials",
            Self::AccessDenied(_) => "access_denied",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::Validation { .. } => "validation_error",
            Self::Provider { .. } => "provider_error",
            Self::NoHealthyDeployment(_) => "no_healthy_deployment",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the orchestrator may retry the request on another deployment.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }

    pub fn wire_body(&self) -> JsonValue {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.kind(),
            "code": self.status().as_u16(),
        });
        match self {
            Self::RateLimited { retry_after, .. } => {
                error["retry_after"] = json!(retry_after);
            }
            Self::Validation { details, .. } if !details.is_null() => {
                error["details"] = details.clone();
            }
            Self::Provider { provider, status, .. } => {
                error["provider"] = json!(provider);
                if let Some(status) = status {
                    error["upstream_status"] = json!(status);
                }
            }
            _ => {}
        }
        json!({ "error": error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(
            GatewayError::MissingCredentials("no header".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::BudgetExceeded("over".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::NoHealthyDeployment("none".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::validation("bad").status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn wire_body_carries_retry_after() {
        let err = GatewayError::RateLimited {
            message: "slow down".into(),
            retry_after: 42,
        };
        let body = err.wire_body();
        assert_eq!(body["error"]["type"], "rate_limited");
        assert_eq!(body["error"]["retry_after"], 42);
        assert_eq!(body["error"]["code"], 429);
    }

    #[test]
    fn provider_error_is_fallback_eligible_only_when_retryable() {
        let retryable = GatewayError::Provider {
            message: "upstream 500".into(),
            provider: "openai".into(),
            status: Some(500),
            retryable: true,
        };
        assert!(retryable.is_retryable());
        assert!(!GatewayError::validation("blocked").is_retryable());
    }
}
