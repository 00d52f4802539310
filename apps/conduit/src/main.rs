use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use conduit_common::CredentialCipher;
use conduit_core::cache::exact::ExactCache;
use conduit_core::cache::CacheManager;
use conduit_core::cost::PricingTable;
use conduit_core::guardrails::GuardrailEngine;
use conduit_core::pipeline::PipelineContext;
use conduit_core::rate_limit::RateLimiter;
use conduit_provider::AdapterRegistry;
use conduit_storage::ConduitStorage;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let config = cli::build_config(cli::Cli::parse())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let storage = ConduitStorage::connect(&config.database_url)
        .await
        .context("connect database")?;
    storage.sync().await.context("sync schema")?;

    let redis = conduit_core::kv::connect(&config.redis_url).await;
    let pricing = Arc::new(PricingTable::load(config.pricing_path.as_deref()));
    let limiter = RateLimiter::new(redis.clone(), config.redis_key_prefix.clone());
    let exact = ExactCache::new(
        redis,
        config.redis_key_prefix.clone(),
        config.cache.exact_ttl_seconds,
    );
    let cache = CacheManager::new(
        config.cache.clone(),
        exact,
        storage.clone(),
        Arc::clone(&pricing),
    );
    let guardrails = GuardrailEngine::new(config.guardrails.clone());
    let cipher = CredentialCipher::derive(&config.encryption_key, &config.encryption_salt);

    if config.master_key.is_empty() {
        tracing::warn!("master key is unset; the admin surface will reject every request");
    }

    let config = Arc::new(config);
    let ctx = Arc::new(PipelineContext {
        storage,
        adapters: Arc::new(AdapterRegistry::new()),
        limiter,
        cache,
        guardrails,
        cipher,
        pricing,
        config: Arc::clone(&config),
    });

    let app = axum::Router::new()
        .merge(conduit_router::proxy_router(Arc::clone(&ctx)))
        .nest("/admin", conduit_admin::admin_router(ctx));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "conduit listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
