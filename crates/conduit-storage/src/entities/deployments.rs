use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "deployments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub name: String,
    /// Provider tag: openai, anthropic, google, ...
    pub provider: String,
    pub model_name: String,
    pub api_base: String,
    /// AES-GCM sealed upstream credential.
    pub api_key_encrypted: String,
    /// Smaller is preferred.
    pub priority: i32,
    pub weight: i32,
    pub is_active: bool,
    pub is_healthy: bool,
    pub consecutive_failures: i32,
    /// Set iff the circuit is open.
    pub cooldown_until: Option<OffsetDateTime>,
    pub max_rpm: Option<i32>,
    pub max_tpm: Option<i32>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
