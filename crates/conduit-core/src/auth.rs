//! Bearer authentication and principal-level access checks.

use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use conduit_common::{GatewayError, hash_api_key};
use conduit_storage::ConduitStorage;
use conduit_storage::entities::api_keys;

/// The authenticated caller. Either a stored API key or the ambient admin
/// synthesized from the master secret.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: Uuid,
    pub key_prefix: String,
    pub alias: Option<String>,
    pub allowed_models: Option<Vec<String>>,
    pub budget_limit_usd: Option<Decimal>,
    pub spend_usd: Decimal,
    pub rate_limit_rpm: Option<i64>,
    pub rate_limit_tpm: Option<i64>,
    pub is_master: bool,
}

impl Principal {
    /// Ambient admin: fixed nil id, no quotas, skips rate limiting.
    pub fn master() -> Self {
        Self {
            id: Uuid::nil(),
            key_prefix: "cnd_admin_".to_string(),
            alias: Some("master_admin".to_string()),
            allowed_models: None,
            budget_limit_usd: None,
            spend_usd: Decimal::ZERO,
            rate_limit_rpm: None,
            rate_limit_tpm: None,
            is_master: true,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.is_master
    }

    pub fn from_record(record: api_keys::Model) -> Self {
        let allowed_models = record
            .allowed_models
            .and_then(|value| serde_json::from_value::<Vec<String>>(value).ok());
        Self {
            id: record.id,
            key_prefix: record.key_prefix,
            alias: record.alias,
            allowed_models,
            budget_limit_usd: record.budget_limit_usd,
            spend_usd: record.spend_usd,
            rate_limit_rpm: record.rate_limit_rpm.map(i64::from),
            rate_limit_tpm: record.rate_limit_tpm.map(i64::from),
            is_master: false,
        }
    }
}

fn bearer_value(authorization: &str) -> Option<&str> {
    let trimmed = authorization.trim();
    let (scheme, token) = trimmed.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolve the `Authorization` header to a principal.
pub async fn authenticate(
    storage: &ConduitStorage,
    master_key: &str,
    authorization: Option<&str>,
    now: OffsetDateTime,
) -> Result<Principal, GatewayError> {
    let Some(authorization) = authorization else {
        return Err(GatewayError::MissingCredentials(
            "missing Authorization header".into(),
        ));
    };
    let Some(raw_key) = bearer_value(authorization) else {
        return Err(GatewayError::InvalidCredentials(
            "invalid Authorization header, expected: Bearer <key>".into(),
        ));
    };

    if !master_key.is_empty() && raw_key == master_key {
        return Ok(Principal::master());
    }

    let record = storage
        .find_api_key_by_hash(&hash_api_key(raw_key))
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

    let Some(record) = record else {
        return Err(GatewayError::InvalidCredentials("invalid API key".into()));
    };
    if !record.is_active {
        return Err(GatewayError::InvalidCredentials("invalid API key".into()));
    }
    if let Some(expires_at) = record.expires_at
        && expires_at < now
    {
        return Err(GatewayError::ExpiredCredentials("API key has expired".into()));
    }

    Ok(Principal::from_record(record))
}

/// Allow-list check; a principal without a list can reach every model.
pub fn check_model_access(principal: &Principal, model: &str) -> Result<(), GatewayError> {
    match &principal.allowed_models {
        Some(allowed) if !allowed.iter().any(|entry| entry == model) => {
            Err(GatewayError::AccessDenied(format!(
                "API key '{}...' is not allowed to access model '{model}'",
                principal.key_prefix
            )))
        }
        _ => Ok(()),
    }
}

pub fn check_budget(principal: &Principal) -> Result<(), GatewayError> {
    if let Some(limit) = principal.budget_limit_usd
        && principal.spend_usd >= limit
    {
        return Err(GatewayError::BudgetExceeded(format!(
            "API key '{}...' has exceeded its budget: spent ${}, limit ${limit}",
            principal.key_prefix, principal.spend_usd
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::dec;

    fn principal(allowed: Option<Vec<&str>>, limit: Option<Decimal>, spend: Decimal) -> Principal {
        Principal {
            id: Uuid::new_v4(),
            key_prefix: "cnd_sk_test".into(),
            alias: None,
            allowed_models: allowed.map(|models| models.into_iter().map(String::from).collect()),
            budget_limit_usd: limit,
            spend_usd: spend,
            rate_limit_rpm: None,
            rate_limit_tpm: None,
            is_master: false,
        }
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_value("Bearer abc"), Some("abc"));
        assert_eq!(bearer_value("bearer abc"), Some("abc"));
        assert_eq!(bearer_value("  Bearer   abc "), Some("abc"));
        assert_eq!(bearer_value("Basic abc"), None);
        assert_eq!(bearer_value("Bearer "), None);
        assert_eq!(bearer_value("abc"), None);
    }

    #[test]
    fn allow_list_enforcement() {
        let open = principal(None, None, Decimal::ZERO);
        assert!(check_model_access(&open, "gpt-4o").is_ok());

        let restricted = principal(Some(vec!["gpt-4o"]), None, Decimal::ZERO);
        assert!(check_model_access(&restricted, "gpt-4o").is_ok());
        let denied = check_model_access(&restricted, "claude-sonnet-4-20250514").unwrap_err();
        assert_eq!(denied.kind(), "access_denied");
    }

    #[test]
    fn budget_enforcement_at_limit() {
        let under = principal(None, Some(dec!(10)), dec!(9.99));
        assert!(check_budget(&under).is_ok());

        let at_limit = principal(None, Some(dec!(10)), dec!(10));
        assert_eq!(check_budget(&at_limit).unwrap_err().kind(), "budget_exceeded");

        let no_limit = principal(None, None, dec!(1000));
        assert!(check_budget(&no_limit).is_ok());
    }

    #[test]
    fn master_principal_shape() {
        let master = Principal::master();
        assert!(master.is_admin());
        assert!(master.id.is_nil());
        assert!(master.rate_limit_rpm.is_none());
    }
}
