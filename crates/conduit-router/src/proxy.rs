//! OpenAI-compatible wire surface: `POST /v1/chat/completions` and
//! `GET /v1/models`, behind bearer authentication.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Request, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::StreamExt;
use time::OffsetDateTime;

use conduit_common::GatewayError;
use conduit_core::pipeline::{self, PipelineContext};
use conduit_core::{Principal, auth};
use conduit_protocol::openai::{ChatCompletionRequest, ModelInfo, ModelList};

#[derive(Clone)]
pub struct ProxyState {
    pub ctx: Arc<PipelineContext>,
}

pub fn proxy_router(ctx: Arc<PipelineContext>) -> Router {
    let state = ProxyState { ctx };
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth))
        .with_state(state)
}

/// Render a gateway error as the uniform `{"error": {...}}` wire shape.
pub fn error_response(err: &GatewayError) -> Response {
    let mut response = (err.status(), Json(err.wire_body())).into_response();
    if let GatewayError::RateLimited { retry_after, .. } = err
        && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn append_headers(response: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        response.headers_mut().insert(name, value);
    }
}

async fn bearer_auth(
    State(state): State<ProxyState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    match auth::authenticate(
        &state.ctx.storage,
        &state.ctx.config.master_key,
        authorization.as_deref(),
        OffsetDateTime::now_utc(),
    )
    .await
    {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(err) => error_response(&err),
    }
}

async fn chat_completions(
    State(state): State<ProxyState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    tracing::info!(
        model = %request.model,
        messages = request.messages.len(),
        stream = request.is_stream(),
        key_prefix = %principal.key_prefix,
        "chat completion request"
    );

    if request.is_stream() {
        match pipeline::run_streaming(&state.ctx, &principal, request).await {
            Ok(outcome) => {
                let body = Body::from_stream(outcome.body.map(Ok::<_, Infallible>));
                let mut response = Response::new(body);
                let headers = response.headers_mut();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                headers.insert(
                    HeaderName::from_static("x-accel-buffering"),
                    HeaderValue::from_static("no"),
                );
                if let Ok(value) = HeaderValue::from_str(&outcome.request_id) {
                    headers.insert(HeaderName::from_static("x-conduit-request-id"), value);
                }
                append_headers(&mut response, &outcome.headers);
                response
            }
            Err(err) => error_response(&err),
        }
    } else {
        match pipeline::run_completion(&state.ctx, &principal, request).await {
            Ok(outcome) => {
                let mut response = Json(&outcome.response).into_response();
                let extra = [
                    (
                        "x-conduit-cache".to_string(),
                        if outcome.cached { "HIT" } else { "MISS" }.to_string(),
                    ),
                    ("x-conduit-cost-usd".to_string(), outcome.cost_usd.to_string()),
                    ("x-conduit-provider".to_string(), outcome.provider.clone()),
                    ("x-conduit-request-id".to_string(), outcome.request_id.clone()),
                ];
                append_headers(&mut response, &extra);
                append_headers(&mut response, &outcome.headers);
                response
            }
            Err(err) => error_response(&err),
        }
    }
}

/// Distinct active models, filtered through the caller's allow-list.
async fn list_models(
    State(state): State<ProxyState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    let deployments = match state.ctx.storage.list_active_deployments().await {
        Ok(deployments) => deployments,
        Err(error) => {
            return error_response(&GatewayError::Internal(error.to_string()));
        }
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut data = Vec::new();
    for deployment in deployments {
        if !seen.insert(deployment.model_name.clone()) {
            continue;
        }
        if let Some(allowed) = &principal.allowed_models
            && !allowed.iter().any(|model| *model == deployment.model_name)
        {
            continue;
        }
        data.push(ModelInfo {
            id: deployment.model_name,
            object: "model".to_string(),
            created: deployment.created_at.unix_timestamp(),
            owned_by: deployment.provider,
        });
    }

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
    .into_response()
}
