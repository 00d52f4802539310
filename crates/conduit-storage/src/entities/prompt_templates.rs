use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "prompt_templates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    /// Auto-incremented per name by the registry.
    pub version: i32,
    pub description: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub template: String,
    /// Declared variables: `{name: {type, required}}`.
    pub variables: Json,
    pub model_hint: Option<String>,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
