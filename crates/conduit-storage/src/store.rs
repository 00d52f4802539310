use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Schema,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::connect_shared;
use crate::entities;
use crate::entities::{
    api_keys, audit_events, cache_entries, deployments, guardrail_rules, prompt_templates,
    request_logs,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Health fields flushed by the circuit breaker; every transition writes the
/// full triple so racing writers converge on a consistent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthUpdate {
    pub is_healthy: bool,
    pub consecutive_failures: i32,
    pub cooldown_until: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheTableStats {
    pub total_entries: u64,
    pub active_entries: u64,
    pub expired_entries: u64,
    pub total_hits: i64,
    pub total_cost_saved_usd: Decimal,
}

#[derive(Clone)]
pub struct ConduitStorage {
    db: DatabaseConnection,
}

impl ConduitStorage {
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let db = connect_shared(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync, run once at bootstrap.
    pub async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ApiKeys)
            .register(entities::Deployments)
            .register(entities::CacheEntries)
            .register(entities::GuardrailRules)
            .register(entities::PromptTemplates)
            .register(entities::RequestLogs)
            .register(entities::AuditEvents)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    // ── api keys ────────────────────────────────────────────────────────

    pub async fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> StorageResult<Option<api_keys::Model>> {
        Ok(entities::ApiKeys::find()
            .filter(api_keys::Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?)
    }

    pub async fn find_api_key(&self, id: Uuid) -> StorageResult<Option<api_keys::Model>> {
        Ok(entities::ApiKeys::find_by_id(id).one(&self.db).await?)
    }

    pub async fn list_api_keys(&self) -> StorageResult<Vec<api_keys::Model>> {
        Ok(entities::ApiKeys::find()
            .order_by_asc(api_keys::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn insert_api_key(&self, model: api_keys::Model) -> StorageResult<()> {
        entities::ApiKeys::insert(api_keys::ActiveModel::from(model))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update_api_key(&self, active: api_keys::ActiveModel) -> StorageResult<()> {
        active.update(&self.db).await?;
        Ok(())
    }

    /// Serialized by the storage row lock; concurrent completions on the
    /// same principal each add their own cost.
    pub async fn add_spend(&self, key_id: Uuid, amount: Decimal) -> StorageResult<()> {
        entities::ApiKeys::update_many()
            .col_expr(
                api_keys::Column::SpendUsd,
                Expr::col(api_keys::Column::SpendUsd).add(amount),
            )
            .filter(api_keys::Column::Id.eq(key_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn touch_api_key(&self, key_id: Uuid, now: OffsetDateTime) -> StorageResult<()> {
        entities::ApiKeys::update_many()
            .col_expr(api_keys::Column::LastUsedAt, Expr::value(Some(now)))
            .filter(api_keys::Column::Id.eq(key_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ── deployments ─────────────────────────────────────────────────────

    pub async fn active_deployments_for_model(
        &self,
        model: &str,
    ) -> StorageResult<Vec<deployments::Model>> {
        Ok(entities::Deployments::find()
            .filter(deployments::Column::ModelName.eq(model))
            .filter(deployments::Column::IsActive.eq(true))
            .order_by_asc(deployments::Column::Priority)
            .all(&self.db)
            .await?)
    }

    pub async fn list_deployments(&self) -> StorageResult<Vec<deployments::Model>> {
        Ok(entities::Deployments::find()
            .order_by_asc(deployments::Column::Name)
            .all(&self.db)
            .await?)
    }

    pub async fn list_active_deployments(&self) -> StorageResult<Vec<deployments::Model>> {
        Ok(entities::Deployments::find()
            .filter(deployments::Column::IsActive.eq(true))
            .order_by_asc(deployments::Column::Priority)
            .all(&self.db)
            .await?)
    }

    pub async fn find_deployment(&self, id: Uuid) -> StorageResult<Option<deployments::Model>> {
        Ok(entities::Deployments::find_by_id(id).one(&self.db).await?)
    }

    pub async fn find_deployment_by_name(
        &self,
        name: &str,
    ) -> StorageResult<Option<deployments::Model>> {
        Ok(entities::Deployments::find()
            .filter(deployments::Column::Name.eq(name))
            .one(&self.db)
            .await?)
    }

    pub async fn insert_deployment(&self, model: deployments::Model) -> StorageResult<()> {
        entities::Deployments::insert(deployments::ActiveModel::from(model))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update_deployment(&self, active: deployments::ActiveModel) -> StorageResult<()> {
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn delete_deployment(&self, id: Uuid) -> StorageResult<bool> {
        let result = entities::Deployments::delete_by_id(id).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn apply_deployment_health(
        &self,
        id: Uuid,
        update: HealthUpdate,
    ) -> StorageResult<()> {
        entities::Deployments::update_many()
            .col_expr(
                deployments::Column::IsHealthy,
                Expr::value(update.is_healthy),
            )
            .col_expr(
                deployments::Column::ConsecutiveFailures,
                Expr::value(update.consecutive_failures),
            )
            .col_expr(
                deployments::Column::CooldownUntil,
                Expr::value(update.cooldown_until),
            )
            .filter(deployments::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ── guardrail rules ─────────────────────────────────────────────────

    /// Active rules in execution order; the engine filters by stage.
    pub async fn active_guardrail_rules(&self) -> StorageResult<Vec<guardrail_rules::Model>> {
        Ok(entities::GuardrailRules::find()
            .filter(guardrail_rules::Column::IsActive.eq(true))
            .order_by_asc(guardrail_rules::Column::Priority)
            .all(&self.db)
            .await?)
    }

    pub async fn list_guardrail_rules(&self) -> StorageResult<Vec<guardrail_rules::Model>> {
        Ok(entities::GuardrailRules::find()
            .order_by_asc(guardrail_rules::Column::Priority)
            .all(&self.db)
            .await?)
    }

    pub async fn find_guardrail_rule(
        &self,
        id: Uuid,
    ) -> StorageResult<Option<guardrail_rules::Model>> {
        Ok(entities::GuardrailRules::find_by_id(id).one(&self.db).await?)
    }

    pub async fn insert_guardrail_rule(&self, model: guardrail_rules::Model) -> StorageResult<()> {
        entities::GuardrailRules::insert(guardrail_rules::ActiveModel::from(model))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update_guardrail_rule(
        &self,
        active: guardrail_rules::ActiveModel,
    ) -> StorageResult<()> {
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn delete_guardrail_rule(&self, id: Uuid) -> StorageResult<bool> {
        let result = entities::GuardrailRules::delete_by_id(id)
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    // ── request logs ────────────────────────────────────────────────────

    pub async fn insert_request_log(&self, model: request_logs::Model) -> StorageResult<()> {
        entities::RequestLogs::insert(request_logs::ActiveModel::from(model))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn request_logs_between(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> StorageResult<Vec<request_logs::Model>> {
        Ok(entities::RequestLogs::find()
            .filter(request_logs::Column::CreatedAt.gte(from))
            .filter(request_logs::Column::CreatedAt.lte(to))
            .order_by_asc(request_logs::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    // ── cache entries ───────────────────────────────────────────────────

    pub async fn live_cache_entries(
        &self,
        model: &str,
        now: OffsetDateTime,
    ) -> StorageResult<Vec<cache_entries::Model>> {
        Ok(entities::CacheEntries::find()
            .filter(cache_entries::Column::Model.eq(model))
            .filter(cache_entries::Column::ExpiresAt.gt(now))
            .all(&self.db)
            .await?)
    }

    pub async fn insert_cache_entry(&self, model: cache_entries::Model) -> StorageResult<()> {
        entities::CacheEntries::insert(cache_entries::ActiveModel::from(model))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn record_cache_hit(&self, id: Uuid, cost_saved: Decimal) -> StorageResult<()> {
        entities::CacheEntries::update_many()
            .col_expr(
                cache_entries::Column::HitCount,
                Expr::col(cache_entries::Column::HitCount).add(1),
            )
            .col_expr(
                cache_entries::Column::CostSavedUsd,
                Expr::col(cache_entries::Column::CostSavedUsd).add(cost_saved),
            )
            .filter(cache_entries::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_cache_entries(&self, model: Option<&str>) -> StorageResult<u64> {
        let mut delete = entities::CacheEntries::delete_many();
        if let Some(model) = model {
            delete = delete.filter(cache_entries::Column::Model.eq(model));
        }
        Ok(delete.exec(&self.db).await?.rows_affected)
    }

    pub async fn cache_table_stats(&self, now: OffsetDateTime) -> StorageResult<CacheTableStats> {
        let total_entries = entities::CacheEntries::find().count(&self.db).await?;
        let active_entries = entities::CacheEntries::find()
            .filter(cache_entries::Column::ExpiresAt.gt(now))
            .count(&self.db)
            .await?;

        let mut total_hits = 0i64;
        let mut total_cost_saved_usd = Decimal::ZERO;
        for entry in entities::CacheEntries::find().all(&self.db).await? {
            total_hits += i64::from(entry.hit_count);
            total_cost_saved_usd += entry.cost_saved_usd;
        }

        Ok(CacheTableStats {
            total_entries,
            active_entries,
            expired_entries: total_entries.saturating_sub(active_entries),
            total_hits,
            total_cost_saved_usd,
        })
    }

    // ── prompt templates ────────────────────────────────────────────────

    pub async fn latest_prompt_version(&self, name: &str) -> StorageResult<i32> {
        Ok(entities::PromptTemplates::find()
            .filter(prompt_templates::Column::Name.eq(name))
            .order_by_desc(prompt_templates::Column::Version)
            .one(&self.db)
            .await?
            .map(|prompt| prompt.version)
            .unwrap_or(0))
    }

    pub async fn find_prompt(
        &self,
        name: &str,
        version: Option<i32>,
    ) -> StorageResult<Option<prompt_templates::Model>> {
        let mut query =
            entities::PromptTemplates::find().filter(prompt_templates::Column::Name.eq(name));
        query = match version {
            Some(version) => query.filter(prompt_templates::Column::Version.eq(version)),
            None => query.order_by_desc(prompt_templates::Column::Version),
        };
        Ok(query.one(&self.db).await?)
    }

    pub async fn list_prompts(&self) -> StorageResult<Vec<prompt_templates::Model>> {
        Ok(entities::PromptTemplates::find()
            .order_by_asc(prompt_templates::Column::Name)
            .order_by_desc(prompt_templates::Column::Version)
            .all(&self.db)
            .await?)
    }

    pub async fn insert_prompt(&self, model: prompt_templates::Model) -> StorageResult<()> {
        entities::PromptTemplates::insert(prompt_templates::ActiveModel::from(model))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ── audit ───────────────────────────────────────────────────────────

    pub async fn append_audit_event(&self, model: audit_events::Model) -> StorageResult<()> {
        entities::AuditEvents::insert(audit_events::ActiveModel::from(model))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
