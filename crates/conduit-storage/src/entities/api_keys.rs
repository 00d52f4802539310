use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Hex SHA-256 of the raw key; the raw key is never stored.
    #[sea_orm(unique)]
    pub key_hash: String,
    pub key_prefix: String,
    pub alias: Option<String>,
    /// JSON array of model names; NULL means unrestricted.
    pub allowed_models: Option<Json>,
    pub budget_limit_usd: Option<Decimal>,
    pub spend_usd: Decimal,
    pub rate_limit_rpm: Option<i32>,
    pub rate_limit_tpm: Option<i32>,
    pub is_active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
