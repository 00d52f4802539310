//! Shared Redis handle. The gateway prefers availability over strict
//! enforcement: when the KV is unreachable the limiter and exact cache
//! degrade rather than failing requests, so a missing connection at boot is
//! a warning, not an error.

use redis::aio::ConnectionManager;

pub async fn connect(url: &str) -> Option<ConnectionManager> {
    let client = match redis::Client::open(url) {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(%error, "invalid redis url, rate limiting and exact cache disabled");
            return None;
        }
    };
    match ConnectionManager::new(client).await {
        Ok(manager) => Some(manager),
        Err(error) => {
            tracing::warn!(%error, "redis unreachable, rate limiting and exact cache disabled");
            None
        }
    }
}
