//! The completion orchestrator: a fixed, linear composition of the
//! pipeline components.
//!
//! Non-streaming order: access/budget check, RPM pre-check, pre-request
//! guardrails (redactions substitute for all downstream steps), cache
//! lookup, routed fallback attempts with breaker bookkeeping, post-response
//! guardrails, cost + spend, TPM usage, cache store, request log.
//!
//! The streaming variant skips the cache, forwards chunks as SSE frames
//! while accumulating, and performs accounting after the upstream closes —
//! including when the client disconnects mid-stream.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde_json::json;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use conduit_common::config::GatewayConfig;
use conduit_common::{CredentialCipher, GatewayError};
use conduit_protocol::openai::{ChatCompletionRequest, ChatCompletionResponse};
use conduit_protocol::sse;
use conduit_provider::{AdapterSet, ChunkStream, ProviderFailure, UpstreamTarget};
use conduit_storage::ConduitStorage;
use conduit_storage::entities::{deployments, request_logs};

use crate::auth::{self, Principal};
use crate::breaker;
use crate::cache::CacheManager;
use crate::cost::{PricingTable, calculate_cost};
use crate::guardrails::GuardrailEngine;
use crate::rate_limit::{
    RateDecision, RateLimiter, rate_limit_headers, rpm_identifier, tpm_identifier,
};
use crate::router;
use crate::streaming::StreamAccumulator;

/// Process-wide singletons wired together at bootstrap and shared by every
/// request task.
pub struct PipelineContext {
    pub storage: ConduitStorage,
    pub adapters: Arc<dyn AdapterSet>,
    pub limiter: RateLimiter,
    pub cache: CacheManager,
    pub guardrails: GuardrailEngine,
    pub cipher: CredentialCipher,
    pub pricing: Arc<PricingTable>,
    pub config: Arc<GatewayConfig>,
}

#[derive(Debug)]
pub struct CompletionOutcome {
    pub response: ChatCompletionResponse,
    pub request_id: String,
    pub provider: String,
    pub cost_usd: Decimal,
    pub cached: bool,
    pub latency_ms: i64,
    pub headers: Vec<(String, String)>,
}

pub struct StreamingOutcome {
    pub request_id: String,
    pub headers: Vec<(String, String)>,
    pub body: ReceiverStream<Bytes>,
}

struct LogRow<'a> {
    request_id: &'a str,
    deployment_id: Option<Uuid>,
    model: &'a str,
    provider: &'a str,
    prompt_tokens: i64,
    completion_tokens: i64,
    cost_usd: Decimal,
    latency_ms: i64,
    status_code: u16,
    cached: bool,
    pii_redacted: bool,
    error_message: Option<String>,
}

pub async fn run_completion(
    ctx: &Arc<PipelineContext>,
    principal: &Principal,
    mut request: ChatCompletionRequest,
) -> Result<CompletionOutcome, GatewayError> {
    let started = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    auth::check_model_access(principal, &request.model)?;
    auth::check_budget(principal)?;
    let rpm_decision = rpm_precheck(ctx, principal).await?;

    let rules = ctx
        .storage
        .active_guardrail_rules()
        .await
        .map_err(internal)?;
    let report = ctx.guardrails.run_pre(&request.messages, &rules)?;
    let pii_redacted = report.pii_redacted;
    if let Some(redacted) = report.redacted_messages {
        request.messages = redacted;
    }

    if let Some(hit) = ctx.cache.lookup(&request.messages, &request.model).await {
        let latency_ms = elapsed_ms(started);
        write_log(
            ctx,
            principal,
            LogRow {
                request_id: &request_id,
                deployment_id: None,
                model: &request.model,
                provider: "cache",
                prompt_tokens: hit.response.usage.prompt_tokens,
                completion_tokens: hit.response.usage.completion_tokens,
                cost_usd: Decimal::ZERO,
                latency_ms,
                status_code: 200,
                cached: true,
                pii_redacted,
                error_message: None,
            },
        )
        .await;
        return Ok(CompletionOutcome {
            response: hit.response,
            request_id,
            provider: "cache".to_string(),
            cost_usd: Decimal::ZERO,
            cached: true,
            latency_ms,
            headers: rate_limit_headers(rpm_decision.as_ref(), None),
        });
    }

    let chain = router::build_chain(
        &ctx.storage,
        &request.model,
        &ctx.config.routing,
        &ctx.pricing,
        OffsetDateTime::now_utc(),
    )
    .await?;

    let (deployment, response) = match attempt_chain(ctx, &request, chain).await {
        Ok(success) => success,
        Err(err) => {
            if let GatewayError::Provider { provider, .. } = &err {
                write_log(
                    ctx,
                    principal,
                    LogRow {
                        request_id: &request_id,
                        deployment_id: None,
                        model: &request.model,
                        provider,
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        cost_usd: Decimal::ZERO,
                        latency_ms: elapsed_ms(started),
                        status_code: err.status().as_u16(),
                        cached: false,
                        pii_redacted,
                        error_message: Some(err.to_string()),
                    },
                )
                .await;
            }
            return Err(err);
        }
    };

    let assistant_text = response.assistant_text();
    if !assistant_text.is_empty() {
        ctx.guardrails.run_post(&assistant_text, &rules);
    }

    let cost_usd = calculate_cost(
        &ctx.pricing,
        &request.model,
        response.usage.prompt_tokens,
        response.usage.completion_tokens,
    );
    settle(ctx, principal, cost_usd, response.usage.total_tokens).await;

    ctx.cache
        .store(
            &request.messages,
            &request.model,
            &response,
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
        )
        .await;

    let latency_ms = elapsed_ms(started);
    write_log(
        ctx,
        principal,
        LogRow {
            request_id: &request_id,
            deployment_id: Some(deployment.id),
            model: &request.model,
            provider: &deployment.provider,
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            cost_usd,
            latency_ms,
            status_code: 200,
            cached: false,
            pii_redacted,
            error_message: None,
        },
    )
    .await;

    let tpm_decision = tpm_peek(ctx, principal).await;
    Ok(CompletionOutcome {
        response,
        request_id,
        provider: deployment.provider,
        cost_usd,
        cached: false,
        latency_ms,
        headers: rate_limit_headers(rpm_decision.as_ref(), tpm_decision.as_ref()),
    })
}

pub async fn run_streaming(
    ctx: &Arc<PipelineContext>,
    principal: &Principal,
    mut request: ChatCompletionRequest,
) -> Result<StreamingOutcome, GatewayError> {
    let started = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    auth::check_model_access(principal, &request.model)?;
    auth::check_budget(principal)?;
    let rpm_decision = rpm_precheck(ctx, principal).await?;

    let rules = ctx
        .storage
        .active_guardrail_rules()
        .await
        .map_err(internal)?;
    let report = ctx.guardrails.run_pre(&request.messages, &rules)?;
    let pii_redacted = report.pii_redacted;
    if let Some(redacted) = report.redacted_messages {
        request.messages = redacted;
    }

    // Streamed responses are not cached; go straight to the router.
    let chain = router::build_chain(
        &ctx.storage,
        &request.model,
        &ctx.config.routing,
        &ctx.pricing,
        OffsetDateTime::now_utc(),
    )
    .await?;

    let mut last_failure: Option<ProviderFailure> = None;
    let mut acquired: Option<(deployments::Model, ChunkStream)> = None;
    for deployment in chain {
        let Some(adapter) = ctx.adapters.adapter(&deployment.provider) else {
            tracing::error!(
                provider = %deployment.provider,
                deployment = %deployment.name,
                "no adapter registered for provider tag"
            );
            continue;
        };
        let target = match resolve_target(&ctx.cipher, &deployment) {
            Ok(target) => target,
            Err(error) => {
                tracing::error!(deployment = %deployment.name, error, "credential unusable");
                continue;
            }
        };
        match adapter.stream(&request, &target).await {
            Ok(stream) => {
                record_success(ctx, &deployment).await;
                acquired = Some((deployment, stream));
                break;
            }
            Err(failure) => {
                tracing::warn!(deployment = %deployment.name, error = %failure, "stream attempt failed");
                record_failure(ctx, &deployment).await;
                last_failure = Some(failure);
            }
        }
    }
    let Some((deployment, upstream)) = acquired else {
        return Err(surface(last_failure));
    };

    let headers = rate_limit_headers(rpm_decision.as_ref(), None);
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    let ctx = Arc::clone(ctx);
    let principal = principal.clone();
    let task_request_id = request_id.clone();
    tokio::spawn(async move {
        let request_id = task_request_id;
        let mut upstream = upstream;
        let mut accumulator = StreamAccumulator::default();
        let mut client_connected = true;
        let mut stream_error: Option<String> = None;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    accumulator.observe(&chunk);
                    if tx.send(sse::data_frame(&chunk)).await.is_err() {
                        // Client cancelled: stop forwarding, keep the
                        // accounting for tokens already received.
                        client_connected = false;
                        break;
                    }
                }
                Err(failure) => {
                    // Mid-stream failures cannot fall back; report inline.
                    stream_error = Some(failure.to_string());
                    let _ = tx
                        .send(sse::data_frame(&failure.into_gateway_error().wire_body()))
                        .await;
                    break;
                }
            }
        }
        if client_connected {
            let _ = tx.send(sse::done_frame()).await;
        }
        drop(tx);

        // Post-stream side effects: guardrails, cost, spend, TPM, log.
        let text = accumulator.assembled_content().to_string();
        if !text.is_empty() {
            match ctx.storage.active_guardrail_rules().await {
                Ok(rules) => {
                    ctx.guardrails.run_post(&text, &rules);
                }
                Err(error) => {
                    tracing::warn!(%error, "post-stream guardrails skipped");
                }
            }
        }
        accumulator.finalize_tokens(&request.messages, &request.model);
        let cost_usd = calculate_cost(
            &ctx.pricing,
            &request.model,
            accumulator.prompt_tokens,
            accumulator.completion_tokens,
        );
        settle(&ctx, &principal, cost_usd, accumulator.total_tokens()).await;
        write_log(
            &ctx,
            &principal,
            LogRow {
                request_id: &request_id,
                deployment_id: Some(deployment.id),
                model: &request.model,
                provider: &deployment.provider,
                prompt_tokens: accumulator.prompt_tokens,
                completion_tokens: accumulator.completion_tokens,
                cost_usd,
                latency_ms: elapsed_ms(started),
                status_code: 200,
                cached: false,
                pii_redacted,
                error_message: stream_error,
            },
        )
        .await;
    });

    Ok(StreamingOutcome {
        request_id,
        headers,
        body: ReceiverStream::new(rx),
    })
}

async fn attempt_chain(
    ctx: &Arc<PipelineContext>,
    request: &ChatCompletionRequest,
    chain: Vec<deployments::Model>,
) -> Result<(deployments::Model, ChatCompletionResponse), GatewayError> {
    let mut last_failure: Option<ProviderFailure> = None;
    for deployment in chain {
        let Some(adapter) = ctx.adapters.adapter(&deployment.provider) else {
            tracing::error!(
                provider = %deployment.provider,
                deployment = %deployment.name,
                "no adapter registered for provider tag"
            );
            continue;
        };
        let target = match resolve_target(&ctx.cipher, &deployment) {
            Ok(target) => target,
            Err(error) => {
                tracing::error!(deployment = %deployment.name, error, "credential unusable");
                continue;
            }
        };
        match adapter.send(request, &target).await {
            Ok(response) => {
                record_success(ctx, &deployment).await;
                return Ok((deployment, response));
            }
            Err(failure) => {
                tracing::warn!(deployment = %deployment.name, error = %failure, "provider attempt failed");
                record_failure(ctx, &deployment).await;
                last_failure = Some(failure);
            }
        }
    }
    Err(surface(last_failure))
}

fn surface(last_failure: Option<ProviderFailure>) -> GatewayError {
    match last_failure {
        Some(failure) => failure.into_gateway_error(),
        None => GatewayError::NoHealthyDeployment(
            "no usable deployment in the fallback chain".into(),
        ),
    }
}

pub fn resolve_target(
    cipher: &CredentialCipher,
    deployment: &deployments::Model,
) -> Result<UpstreamTarget, String> {
    let api_key = cipher
        .open(&deployment.api_key_encrypted)
        .map_err(|err| err.to_string())?;
    Ok(UpstreamTarget {
        deployment_name: deployment.name.clone(),
        model: deployment.model_name.clone(),
        api_base: deployment.api_base.clone(),
        api_key,
    })
}

async fn record_success(ctx: &PipelineContext, deployment: &deployments::Model) {
    if let Some(update) = breaker::on_success(deployment)
        && let Err(error) = ctx.storage.apply_deployment_health(deployment.id, update).await
    {
        tracing::warn!(deployment = %deployment.name, %error, "breaker success flush failed");
    }
}

async fn record_failure(ctx: &PipelineContext, deployment: &deployments::Model) {
    let update = breaker::on_failure(deployment, OffsetDateTime::now_utc(), &ctx.config.breaker);
    if !update.is_healthy && deployment.is_healthy {
        tracing::warn!(
            deployment = %deployment.name,
            failures = update.consecutive_failures,
            "circuit opened"
        );
    }
    if let Err(error) = ctx.storage.apply_deployment_health(deployment.id, update).await {
        tracing::warn!(deployment = %deployment.name, %error, "breaker failure flush failed");
    }
}

async fn rpm_precheck(
    ctx: &PipelineContext,
    principal: &Principal,
) -> Result<Option<RateDecision>, GatewayError> {
    if principal.is_master {
        return Ok(None);
    }
    let Some(limit) = principal.rate_limit_rpm else {
        return Ok(None);
    };
    let decision = ctx
        .limiter
        .check_or_reject(&rpm_identifier(&principal.id), limit, 1)
        .await?;
    Ok(Some(decision))
}

/// Read-only TPM snapshot for response headers.
async fn tpm_peek(ctx: &PipelineContext, principal: &Principal) -> Option<RateDecision> {
    if principal.is_master {
        return None;
    }
    let limit = principal.rate_limit_tpm?;
    Some(
        ctx.limiter
            .check(&tpm_identifier(&principal.id), limit, 0)
            .await,
    )
}

/// Spend and TPM accounting for a completed request.
async fn settle(ctx: &PipelineContext, principal: &Principal, cost: Decimal, total_tokens: i64) {
    if principal.is_master {
        return;
    }
    if cost > Decimal::ZERO
        && let Err(error) = ctx.storage.add_spend(principal.id, cost).await
    {
        tracing::warn!(%error, "spend update failed");
    }
    if let Err(error) = ctx
        .storage
        .touch_api_key(principal.id, OffsetDateTime::now_utc())
        .await
    {
        tracing::debug!(%error, "last_used update failed");
    }
    ctx.limiter
        .record_usage(&tpm_identifier(&principal.id), total_tokens)
        .await;
}

/// Append the request log; failures are logged and swallowed so the
/// response is never broken by bookkeeping.
async fn write_log(ctx: &PipelineContext, principal: &Principal, row: LogRow<'_>) {
    let metadata = row.pii_redacted.then(|| json!({ "pii_redacted": true }));
    let model = request_logs::Model {
        id: Uuid::new_v4(),
        request_id: row.request_id.to_string(),
        api_key_id: (!principal.is_master).then_some(principal.id),
        deployment_id: row.deployment_id,
        model: row.model.to_string(),
        provider: row.provider.to_string(),
        prompt_tokens: row.prompt_tokens as i32,
        completion_tokens: row.completion_tokens as i32,
        cost_usd: row.cost_usd,
        latency_ms: row.latency_ms as i32,
        status_code: i32::from(row.status_code),
        cached: row.cached,
        metadata,
        error_message: row.error_message,
        created_at: OffsetDateTime::now_utc(),
    };
    if let Err(error) = ctx.storage.insert_request_log(model).await {
        tracing::warn!(%error, "request log write failed");
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

fn internal(error: conduit_storage::StorageError) -> GatewayError {
    GatewayError::Internal(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_target_round_trips_credentials() {
        let cipher = CredentialCipher::derive("secret", "salt");
        let now = OffsetDateTime::now_utc();
        let deployment = deployments::Model {
            id: Uuid::new_v4(),
            name: "primary".into(),
            provider: "openai".into(),
            model_name: "gpt-4o".into(),
            api_base: "https://api.openai.com/v1".into(),
            api_key_encrypted: cipher.seal("sk-upstream"),
            priority: 1,
            weight: 100,
            is_active: true,
            is_healthy: true,
            consecutive_failures: 0,
            cooldown_until: None,
            max_rpm: None,
            max_tpm: None,
            created_at: now,
            updated_at: now,
        };
        let target = resolve_target(&cipher, &deployment).unwrap();
        assert_eq!(target.api_key, "sk-upstream");
        assert_eq!(target.model, "gpt-4o");

        let other = CredentialCipher::derive("different", "salt");
        assert!(resolve_target(&other, &deployment).is_err());
    }
}
