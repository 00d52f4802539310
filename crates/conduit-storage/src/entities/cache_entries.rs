use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "cache_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// SHA-256 over `model::normalized_prompt`, shared with the exact tier.
    pub prompt_hash: String,
    /// 384-dim embedding of the normalized prompt, stored as a JSON array.
    pub prompt_embedding: Json,
    pub model: String,
    #[sea_orm(column_type = "Text")]
    pub prompt_text: String,
    pub response_payload: Json,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub hit_count: i32,
    pub cost_saved_usd: Decimal,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
