use std::path::PathBuf;

use clap::Parser;

use conduit_common::config::{ConfigPatch, GatewayConfig};

/// Configuration layering: defaults < config file < environment / flags.
#[derive(Parser)]
#[command(name = "conduit", version, about = "OpenAI-compatible LLM gateway")]
pub(crate) struct Cli {
    /// Optional TOML config file.
    #[arg(long, env = "CONDUIT_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, env = "CONDUIT_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "CONDUIT_PORT")]
    pub(crate) port: Option<u16>,
    #[arg(long, env = "CONDUIT_DATABASE_URL")]
    pub(crate) database_url: Option<String>,
    #[arg(long, env = "CONDUIT_REDIS_URL")]
    pub(crate) redis_url: Option<String>,
    #[arg(long, env = "CONDUIT_MASTER_KEY")]
    pub(crate) master_key: Option<String>,
    #[arg(long, env = "CONDUIT_ENCRYPTION_KEY")]
    pub(crate) encryption_key: Option<String>,
    #[arg(long, env = "CONDUIT_ENCRYPTION_SALT")]
    pub(crate) encryption_salt: Option<String>,
    #[arg(long, env = "CONDUIT_LOG_FILTER")]
    pub(crate) log_filter: Option<String>,
    /// JSON pricing table overriding the built-in one.
    #[arg(long, env = "CONDUIT_PRICING_PATH")]
    pub(crate) pricing_path: Option<PathBuf>,
}

pub(crate) fn build_config(cli: Cli) -> anyhow::Result<GatewayConfig> {
    let mut config = GatewayConfig::default();

    if let Some(path) = &cli.config {
        config.apply(ConfigPatch::from_file(path)?);
    }

    config.apply(ConfigPatch {
        host: cli.host,
        port: cli.port,
        database_url: cli.database_url,
        redis_url: cli.redis_url,
        master_key: cli.master_key,
        encryption_key: cli.encryption_key,
        encryption_salt: cli.encryption_salt,
        log_filter: cli.log_filter,
        pricing_path: cli.pricing_path,
        ..Default::default()
    });

    Ok(config)
}
