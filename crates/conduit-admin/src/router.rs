//! Operator surface under `/admin/v1`: key, deployment, guardrail-rule and
//! prompt CRUD, cache operations, usage analytics, deployment health.
//!
//! All handlers require the master secret (or an admin principal). Raw API
//! keys appear exactly once, in the create response; upstream credentials
//! are sealed on write and never returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Extension, Json, Router};
use rust_decimal::Decimal;
use sea_orm::ActiveValue::Set;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use time::OffsetDateTime;
use uuid::Uuid;

use conduit_common::{GatewayError, generate_api_key};
use conduit_core::pipeline::PipelineContext;
use conduit_core::{Principal, auth, breaker, prompts};
use conduit_storage::entities::{
    api_keys, audit_events, deployments, guardrail_rules, prompt_templates,
};

#[derive(Clone)]
pub struct AdminState {
    pub ctx: Arc<PipelineContext>,
}

pub fn admin_router(ctx: Arc<PipelineContext>) -> Router {
    let state = AdminState { ctx };
    Router::new()
        .route("/v1/keys", post(create_key).get(list_keys))
        .route("/v1/keys/{id}", get(get_key).patch(update_key).delete(revoke_key))
        .route(
            "/v1/models/deployments",
            post(create_deployment).get(list_deployments),
        )
        .route(
            "/v1/models/deployments/{id}",
            patch(update_deployment).delete(delete_deployment),
        )
        .route("/v1/guardrails/rules", post(create_rule).get(list_rules))
        .route(
            "/v1/guardrails/rules/{id}",
            patch(update_rule).delete(delete_rule),
        )
        .route("/v1/prompts", post(create_prompt).get(list_prompts))
        .route("/v1/prompts/{name}", get(get_prompt))
        .route("/v1/prompts/{name}/render", post(render_prompt))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/clear", post(cache_clear))
        .route("/v1/analytics/usage", get(analytics_usage))
        .route("/v1/health/deployments", get(health_deployments))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let principal = match auth::authenticate(
        &state.ctx.storage,
        &state.ctx.config.master_key,
        authorization.as_deref(),
        OffsetDateTime::now_utc(),
    )
    .await
    {
        Ok(principal) => principal,
        Err(err) => return error_response(&err),
    };
    if !principal.is_admin() {
        return error_response(&GatewayError::AccessDenied("admin access required".into()));
    }
    request.extensions_mut().insert(principal);
    next.run(request).await
}

fn error_response(err: &GatewayError) -> Response {
    (err.status(), Json(err.wire_body())).into_response()
}

fn internal(error: impl std::fmt::Display) -> GatewayError {
    GatewayError::Internal(error.to_string())
}

async fn audit(state: &AdminState, actor: &Principal, action: &str, entity: &str, id: String) {
    let event = audit_events::Model {
        id: Uuid::new_v4(),
        actor: actor.alias.clone().unwrap_or_else(|| actor.key_prefix.clone()),
        action: action.to_string(),
        entity: entity.to_string(),
        entity_id: Some(id),
        detail: None,
        created_at: OffsetDateTime::now_utc(),
    };
    if let Err(error) = state.ctx.storage.append_audit_event(event).await {
        tracing::warn!(%error, "audit append failed");
    }
}

// ── keys ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateKeyBody {
    alias: Option<String>,
    allowed_models: Option<Vec<String>>,
    budget_limit_usd: Option<Decimal>,
    rate_limit_rpm: Option<i32>,
    rate_limit_tpm: Option<i32>,
    expires_in_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UpdateKeyBody {
    alias: Option<String>,
    allowed_models: Option<Vec<String>>,
    budget_limit_usd: Option<Decimal>,
    rate_limit_rpm: Option<i32>,
    rate_limit_tpm: Option<i32>,
    is_active: Option<bool>,
}

fn key_view(record: &api_keys::Model) -> JsonValue {
    json!({
        "id": record.id,
        "key_prefix": record.key_prefix,
        "alias": record.alias,
        "allowed_models": record.allowed_models,
        "budget_limit_usd": record.budget_limit_usd,
        "spend_usd": record.spend_usd,
        "rate_limit_rpm": record.rate_limit_rpm,
        "rate_limit_tpm": record.rate_limit_tpm,
        "is_active": record.is_active,
        "expires_at": record.expires_at.map(format_ts),
        "last_used_at": record.last_used_at.map(format_ts),
        "created_at": format_ts(record.created_at),
    })
}

fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

async fn create_key(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Json(body): Json<CreateKeyBody>,
) -> Response {
    let minted = generate_api_key();
    let now = OffsetDateTime::now_utc();
    let record = api_keys::Model {
        id: Uuid::new_v4(),
        key_hash: minted.hash,
        key_prefix: minted.prefix,
        alias: body.alias,
        allowed_models: body.allowed_models.map(|models| json!(models)),
        budget_limit_usd: body.budget_limit_usd,
        spend_usd: Decimal::ZERO,
        rate_limit_rpm: body.rate_limit_rpm,
        rate_limit_tpm: body.rate_limit_tpm,
        is_active: true,
        expires_at: body
            .expires_in_days
            .map(|days| now + time::Duration::days(days)),
        last_used_at: None,
        created_at: now,
        updated_at: now,
    };

    if let Err(error) = state.ctx.storage.insert_api_key(record.clone()).await {
        return error_response(&internal(error));
    }
    audit(&state, &actor, "create", "api_key", record.id.to_string()).await;

    let mut view = key_view(&record);
    // The raw key is shown exactly once.
    view["key"] = json!(minted.raw);
    (StatusCode::CREATED, Json(view)).into_response()
}

async fn list_keys(State(state): State<AdminState>) -> Response {
    match state.ctx.storage.list_api_keys().await {
        Ok(records) => {
            Json(json!({ "keys": records.iter().map(key_view).collect::<Vec<_>>() }))
                .into_response()
        }
        Err(error) => error_response(&internal(error)),
    }
}

async fn get_key(State(state): State<AdminState>, Path(id): Path<Uuid>) -> Response {
    match state.ctx.storage.find_api_key(id).await {
        Ok(Some(record)) => Json(key_view(&record)).into_response(),
        Ok(None) => error_response(&GatewayError::NotFound(format!("key {id} not found"))),
        Err(error) => error_response(&internal(error)),
    }
}

async fn update_key(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateKeyBody>,
) -> Response {
    match state.ctx.storage.find_api_key(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(&GatewayError::NotFound(format!("key {id} not found"))),
        Err(error) => return error_response(&internal(error)),
    }

    let mut active = api_keys::ActiveModel {
        id: Set(id),
        updated_at: Set(OffsetDateTime::now_utc()),
        ..Default::default()
    };
    if let Some(alias) = body.alias {
        active.alias = Set(Some(alias));
    }
    if let Some(models) = body.allowed_models {
        active.allowed_models = Set(Some(json!(models)));
    }
    if let Some(budget) = body.budget_limit_usd {
        active.budget_limit_usd = Set(Some(budget));
    }
    if let Some(rpm) = body.rate_limit_rpm {
        active.rate_limit_rpm = Set(Some(rpm));
    }
    if let Some(tpm) = body.rate_limit_tpm {
        active.rate_limit_tpm = Set(Some(tpm));
    }
    if let Some(is_active) = body.is_active {
        active.is_active = Set(is_active);
    }

    if let Err(error) = state.ctx.storage.update_api_key(active).await {
        return error_response(&internal(error));
    }
    audit(&state, &actor, "update", "api_key", id.to_string()).await;
    match state.ctx.storage.find_api_key(id).await {
        Ok(Some(record)) => Json(key_view(&record)).into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Revocation keeps the row for spend history; the key just stops working.
async fn revoke_key(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Response {
    let active = api_keys::ActiveModel {
        id: Set(id),
        is_active: Set(false),
        updated_at: Set(OffsetDateTime::now_utc()),
        ..Default::default()
    };
    if let Err(error) = state.ctx.storage.update_api_key(active).await {
        return error_response(&internal(error));
    }
    audit(&state, &actor, "revoke", "api_key", id.to_string()).await;
    StatusCode::NO_CONTENT.into_response()
}

// ── deployments ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateDeploymentBody {
    name: String,
    provider: String,
    model_name: String,
    api_base: String,
    api_key: String,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default = "default_weight")]
    weight: i32,
    max_rpm: Option<i32>,
    max_tpm: Option<i32>,
}

fn default_priority() -> i32 {
    1
}

fn default_weight() -> i32 {
    100
}

#[derive(Debug, Deserialize)]
struct UpdateDeploymentBody {
    api_base: Option<String>,
    api_key: Option<String>,
    priority: Option<i32>,
    weight: Option<i32>,
    is_active: Option<bool>,
    /// True clears failure counters and closes the circuit.
    reset_health: Option<bool>,
}

fn deployment_view(record: &deployments::Model, now: OffsetDateTime) -> JsonValue {
    json!({
        "id": record.id,
        "name": record.name,
        "provider": record.provider,
        "model_name": record.model_name,
        "api_base": record.api_base,
        "priority": record.priority,
        "weight": record.weight,
        "is_active": record.is_active,
        "is_healthy": record.is_healthy,
        "consecutive_failures": record.consecutive_failures,
        "cooldown_until": record.cooldown_until.map(format_ts),
        "circuit_state": circuit_state_name(record, now),
        "max_rpm": record.max_rpm,
        "max_tpm": record.max_tpm,
        "created_at": format_ts(record.created_at),
    })
}

fn circuit_state_name(record: &deployments::Model, now: OffsetDateTime) -> &'static str {
    match breaker::state(record, now) {
        breaker::CircuitState::Closed => "closed",
        breaker::CircuitState::Open => "open",
        breaker::CircuitState::HalfOpen => "half_open",
    }
}

async fn create_deployment(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Json(body): Json<CreateDeploymentBody>,
) -> Response {
    match state.ctx.storage.find_deployment_by_name(&body.name).await {
        Ok(Some(_)) => {
            return error_response(&GatewayError::Validation {
                message: format!("deployment '{}' already exists", body.name),
                details: JsonValue::Null,
            });
        }
        Ok(None) => {}
        Err(error) => return error_response(&internal(error)),
    }

    let now = OffsetDateTime::now_utc();
    let record = deployments::Model {
        id: Uuid::new_v4(),
        name: body.name,
        provider: body.provider,
        model_name: body.model_name,
        api_base: body.api_base,
        api_key_encrypted: state.ctx.cipher.seal(&body.api_key),
        priority: body.priority,
        weight: body.weight,
        is_active: true,
        is_healthy: true,
        consecutive_failures: 0,
        cooldown_until: None,
        max_rpm: body.max_rpm,
        max_tpm: body.max_tpm,
        created_at: now,
        updated_at: now,
    };
    if let Err(error) = state.ctx.storage.insert_deployment(record.clone()).await {
        return error_response(&internal(error));
    }
    audit(&state, &actor, "create", "deployment", record.id.to_string()).await;
    (StatusCode::CREATED, Json(deployment_view(&record, now))).into_response()
}

async fn list_deployments(State(state): State<AdminState>) -> Response {
    let now = OffsetDateTime::now_utc();
    match state.ctx.storage.list_deployments().await {
        Ok(records) => Json(json!({
            "deployments": records
                .iter()
                .map(|record| deployment_view(record, now))
                .collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(error) => error_response(&internal(error)),
    }
}

async fn update_deployment(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateDeploymentBody>,
) -> Response {
    match state.ctx.storage.find_deployment(id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(&GatewayError::NotFound(format!("deployment {id} not found")));
        }
        Err(error) => return error_response(&internal(error)),
    }

    let mut active = deployments::ActiveModel {
        id: Set(id),
        updated_at: Set(OffsetDateTime::now_utc()),
        ..Default::default()
    };
    if let Some(api_base) = body.api_base {
        active.api_base = Set(api_base);
    }
    if let Some(api_key) = body.api_key {
        active.api_key_encrypted = Set(state.ctx.cipher.seal(&api_key));
    }
    if let Some(priority) = body.priority {
        active.priority = Set(priority);
    }
    if let Some(weight) = body.weight {
        active.weight = Set(weight);
    }
    if let Some(is_active) = body.is_active {
        active.is_active = Set(is_active);
    }
    if body.reset_health == Some(true) {
        active.is_healthy = Set(true);
        active.consecutive_failures = Set(0);
        active.cooldown_until = Set(None);
    }

    if let Err(error) = state.ctx.storage.update_deployment(active).await {
        return error_response(&internal(error));
    }
    audit(&state, &actor, "update", "deployment", id.to_string()).await;
    match state.ctx.storage.find_deployment(id).await {
        Ok(Some(record)) => {
            Json(deployment_view(&record, OffsetDateTime::now_utc())).into_response()
        }
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn delete_deployment(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.ctx.storage.delete_deployment(id).await {
        Ok(true) => {
            audit(&state, &actor, "delete", "deployment", id.to_string()).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_response(&GatewayError::NotFound(format!("deployment {id} not found"))),
        Err(error) => error_response(&internal(error)),
    }
}

// ── guardrail rules ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRuleBody {
    name: String,
    rule_type: String,
    #[serde(default = "default_stage")]
    stage: String,
    #[serde(default = "default_action")]
    action: String,
    #[serde(default)]
    config: JsonValue,
    #[serde(default = "default_rule_priority")]
    priority: i32,
}

fn default_stage() -> String {
    "pre".to_string()
}

fn default_action() -> String {
    "block".to_string()
}

fn default_rule_priority() -> i32 {
    100
}

#[derive(Debug, Deserialize)]
struct UpdateRuleBody {
    stage: Option<String>,
    action: Option<String>,
    config: Option<JsonValue>,
    priority: Option<i32>,
    is_active: Option<bool>,
}

const RULE_TYPES: &[&str] = &["pii", "injection", "content_filter", "regex", "word_list", "max_tokens"];
const RULE_STAGES: &[&str] = &["pre", "post", "both"];
const RULE_ACTIONS: &[&str] = &["block", "redact", "warn", "log"];

fn rule_view(record: &guardrail_rules::Model) -> JsonValue {
    json!({
        "id": record.id,
        "name": record.name,
        "rule_type": record.rule_type,
        "stage": record.stage,
        "action": record.action,
        "config": record.config,
        "priority": record.priority,
        "is_active": record.is_active,
    })
}

async fn create_rule(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Json(body): Json<CreateRuleBody>,
) -> Response {
    if !RULE_TYPES.contains(&body.rule_type.as_str()) {
        return error_response(&GatewayError::validation(format!(
            "unknown rule type '{}'",
            body.rule_type
        )));
    }
    if !RULE_STAGES.contains(&body.stage.as_str()) {
        return error_response(&GatewayError::validation(format!(
            "unknown stage '{}'",
            body.stage
        )));
    }
    if !RULE_ACTIONS.contains(&body.action.as_str()) {
        return error_response(&GatewayError::validation(format!(
            "unknown action '{}'",
            body.action
        )));
    }

    let now = OffsetDateTime::now_utc();
    let record = guardrail_rules::Model {
        id: Uuid::new_v4(),
        name: body.name,
        rule_type: body.rule_type,
        stage: body.stage,
        action: body.action,
        config: body.config,
        priority: body.priority,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    if let Err(error) = state.ctx.storage.insert_guardrail_rule(record.clone()).await {
        return error_response(&internal(error));
    }
    audit(&state, &actor, "create", "guardrail_rule", record.id.to_string()).await;
    (StatusCode::CREATED, Json(rule_view(&record))).into_response()
}

async fn list_rules(State(state): State<AdminState>) -> Response {
    match state.ctx.storage.list_guardrail_rules().await {
        Ok(records) => {
            Json(json!({ "rules": records.iter().map(rule_view).collect::<Vec<_>>() }))
                .into_response()
        }
        Err(error) => error_response(&internal(error)),
    }
}

async fn update_rule(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateRuleBody>,
) -> Response {
    match state.ctx.storage.find_guardrail_rule(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(&GatewayError::NotFound(format!("rule {id} not found"))),
        Err(error) => return error_response(&internal(error)),
    }

    let mut active = guardrail_rules::ActiveModel {
        id: Set(id),
        updated_at: Set(OffsetDateTime::now_utc()),
        ..Default::default()
    };
    if let Some(stage) = body.stage {
        active.stage = Set(stage);
    }
    if let Some(action) = body.action {
        active.action = Set(action);
    }
    if let Some(config) = body.config {
        active.config = Set(config);
    }
    if let Some(priority) = body.priority {
        active.priority = Set(priority);
    }
    if let Some(is_active) = body.is_active {
        active.is_active = Set(is_active);
    }

    if let Err(error) = state.ctx.storage.update_guardrail_rule(active).await {
        return error_response(&internal(error));
    }
    audit(&state, &actor, "update", "guardrail_rule", id.to_string()).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_rule(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.ctx.storage.delete_guardrail_rule(id).await {
        Ok(true) => {
            audit(&state, &actor, "delete", "guardrail_rule", id.to_string()).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_response(&GatewayError::NotFound(format!("rule {id} not found"))),
        Err(error) => error_response(&internal(error)),
    }
}

// ── prompts ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreatePromptBody {
    name: String,
    template: String,
    description: Option<String>,
    variables: Option<JsonValue>,
    model_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenderPromptBody {
    #[serde(default)]
    variables: JsonValue,
    version: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct PromptQuery {
    version: Option<i32>,
}

fn prompt_view(record: &prompt_templates::Model) -> JsonValue {
    json!({
        "id": record.id,
        "name": record.name,
        "version": record.version,
        "description": record.description,
        "template": record.template,
        "variables": record.variables,
        "model_hint": record.model_hint,
        "created_at": format_ts(record.created_at),
    })
}

/// Creating a prompt with an existing name appends the next version.
async fn create_prompt(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Json(body): Json<CreatePromptBody>,
) -> Response {
    let detected = prompts::detect_variables(&body.template);
    let variables = body.variables.unwrap_or_else(|| {
        json!(
            detected
                .iter()
                .map(|name| (name.clone(), json!({"type": "string", "required": true})))
                .collect::<BTreeMap<_, _>>()
        )
    });

    let latest = match state.ctx.storage.latest_prompt_version(&body.name).await {
        Ok(latest) => latest,
        Err(error) => return error_response(&internal(error)),
    };
    let record = prompt_templates::Model {
        id: Uuid::new_v4(),
        name: body.name,
        version: latest + 1,
        description: body.description,
        template: body.template,
        variables,
        model_hint: body.model_hint,
        created_at: OffsetDateTime::now_utc(),
    };
    if let Err(error) = state.ctx.storage.insert_prompt(record.clone()).await {
        return error_response(&internal(error));
    }
    audit(&state, &actor, "create", "prompt_template", record.id.to_string()).await;
    (StatusCode::CREATED, Json(prompt_view(&record))).into_response()
}

async fn list_prompts(State(state): State<AdminState>) -> Response {
    match state.ctx.storage.list_prompts().await {
        Ok(records) => {
            Json(json!({ "prompts": records.iter().map(prompt_view).collect::<Vec<_>>() }))
                .into_response()
        }
        Err(error) => error_response(&internal(error)),
    }
}

async fn get_prompt(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Query(query): Query<PromptQuery>,
) -> Response {
    match state.ctx.storage.find_prompt(&name, query.version).await {
        Ok(Some(record)) => Json(prompt_view(&record)).into_response(),
        Ok(None) => error_response(&GatewayError::NotFound(format!("prompt '{name}' not found"))),
        Err(error) => error_response(&internal(error)),
    }
}

async fn render_prompt(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<RenderPromptBody>,
) -> Response {
    let record = match state.ctx.storage.find_prompt(&name, body.version).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(&GatewayError::NotFound(format!("prompt '{name}' not found")));
        }
        Err(error) => return error_response(&internal(error)),
    };
    match prompts::render(&record.template, &body.variables) {
        Ok(rendered) => Json(json!({
            "name": record.name,
            "version": record.version,
            "rendered": rendered,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

// ── cache / analytics / health ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CacheClearQuery {
    model: Option<String>,
}

async fn cache_stats(State(state): State<AdminState>) -> Response {
    let stats = state.ctx.cache.stats().await;
    Json(json!({
        "total_entries": stats.total_entries,
        "active_entries": stats.active_entries,
        "expired_entries": stats.expired_entries,
        "total_hits": stats.total_hits,
        "total_cost_saved_usd": stats.total_cost_saved_usd,
    }))
    .into_response()
}

async fn cache_clear(
    State(state): State<AdminState>,
    Extension(actor): Extension<Principal>,
    Query(query): Query<CacheClearQuery>,
) -> Response {
    let (exact_cleared, semantic_cleared) = state.ctx.cache.clear(query.model.as_deref()).await;
    audit(
        &state,
        &actor,
        "clear",
        "cache",
        query.model.unwrap_or_else(|| "*".to_string()),
    )
    .await;
    Json(json!({
        "exact_cleared": exact_cleared,
        "semantic_cleared": semantic_cleared,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    from: Option<String>,
    to: Option<String>,
}

fn parse_ts(raw: Option<&str>, fallback: OffsetDateTime) -> OffsetDateTime {
    raw.and_then(|raw| {
        OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok()
    })
    .unwrap_or(fallback)
}

async fn analytics_usage(
    State(state): State<AdminState>,
    Query(query): Query<UsageQuery>,
) -> Response {
    let now = OffsetDateTime::now_utc();
    let from = parse_ts(query.from.as_deref(), now - time::Duration::days(7));
    let to = parse_ts(query.to.as_deref(), now);

    let logs = match state.ctx.storage.request_logs_between(from, to).await {
        Ok(logs) => logs,
        Err(error) => return error_response(&internal(error)),
    };

    let mut total_cost = Decimal::ZERO;
    let mut prompt_tokens = 0i64;
    let mut completion_tokens = 0i64;
    let mut cache_hits = 0u64;
    let mut errors = 0u64;
    let mut by_model: BTreeMap<String, (u64, Decimal)> = BTreeMap::new();
    for log in &logs {
        total_cost += log.cost_usd;
        prompt_tokens += i64::from(log.prompt_tokens);
        completion_tokens += i64::from(log.completion_tokens);
        if log.cached {
            cache_hits += 1;
        }
        if log.status_code >= 400 {
            errors += 1;
        }
        let entry = by_model.entry(log.model.clone()).or_default();
        entry.0 += 1;
        entry.1 += log.cost_usd;
    }

    Json(json!({
        "from": format_ts(from),
        "to": format_ts(to),
        "requests": logs.len(),
        "errors": errors,
        "cache_hits": cache_hits,
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_cost_usd": total_cost,
        "by_model": by_model
            .into_iter()
            .map(|(model, (requests, cost))| json!({
                "model": model,
                "requests": requests,
                "cost_usd": cost,
            }))
            .collect::<Vec<_>>(),
    }))
    .into_response()
}

async fn health_deployments(State(state): State<AdminState>) -> Response {
    let now = OffsetDateTime::now_utc();
    match state.ctx.storage.list_deployments().await {
        Ok(records) => Json(json!({
            "deployments": records
                .iter()
                .map(|record| json!({
                    "name": record.name,
                    "provider": record.provider,
                    "model_name": record.model_name,
                    "is_active": record.is_active,
                    "circuit_state": circuit_state_name(record, now),
                    "consecutive_failures": record.consecutive_failures,
                    "cooldown_until": record.cooldown_until.map(format_ts),
                }))
                .collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(error) => error_response(&internal(error)),
    }
}
