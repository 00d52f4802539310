//! Sliding-window rate limiter over Redis sorted sets.
//!
//! The check-and-insert is a single server-side script, so concurrent
//! checks against the same identifier cannot oversubscribe the window.
//! When Redis is unreachable the limiter fails open: the request is
//! admitted with no headers and a warning is logged.

use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;

use conduit_common::GatewayError;

const WINDOW_SECONDS: i64 = 60;

/// KEYS[1] = window key; ARGV = limit, window, now, increment, force.
/// Returns {allowed, count, oldest_ts}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local increment = tonumber(ARGV[4])
local force = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)

local allowed = 0
if force == 1 or count + increment <= limit then
    for i = 1, increment do
        redis.call('ZADD', key, now, now .. '-' .. i .. '-' .. math.random(1000000))
    end
    if increment > 0 then
        redis.call('EXPIRE', key, window)
    end
    allowed = 1
    count = count + increment
end

local oldest = now
local head = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if head[2] then
    oldest = tonumber(head[2])
end

return {allowed, count, oldest}
"#;

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    pub reset_seconds: i64,
    /// False when Redis was unreachable and the check failed open.
    pub enforced: bool,
}

impl RateDecision {
    fn fail_open(limit: i64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: 0,
            reset_seconds: 0,
            enforced: false,
        }
    }
}

pub fn rpm_identifier(principal_id: &uuid::Uuid) -> String {
    format!("rpm:key:{principal_id}")
}

pub fn tpm_identifier(principal_id: &uuid::Uuid) -> String {
    format!("tpm:key:{principal_id}")
}

#[derive(Clone)]
pub struct RateLimiter {
    connection: Option<ConnectionManager>,
    prefix: String,
    script: Arc<Script>,
}

impl RateLimiter {
    pub fn new(connection: Option<ConnectionManager>, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            script: Arc::new(Script::new(SLIDING_WINDOW_SCRIPT)),
        }
    }

    async fn run_window(
        &self,
        identifier: &str,
        limit: i64,
        increment: i64,
        force: bool,
    ) -> RateDecision {
        let Some(connection) = &self.connection else {
            return RateDecision::fail_open(limit);
        };
        let key = format!("{}ratelimit:{identifier}", self.prefix);
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let result: Result<Vec<i64>, redis::RedisError> = self
            .script
            .key(&key)
            .arg(limit)
            .arg(WINDOW_SECONDS)
            .arg(now)
            .arg(increment)
            .arg(i64::from(force))
            .invoke_async(&mut connection.clone())
            .await;

        match result {
            Ok(values) if values.len() == 3 => {
                let (allowed, count, oldest) = (values[0], values[1], values[2]);
                RateDecision {
                    allowed: allowed == 1,
                    limit,
                    remaining: (limit - count).max(0),
                    reset_seconds: (WINDOW_SECONDS - (now - oldest)).clamp(0, WINDOW_SECONDS),
                    enforced: true,
                }
            }
            Ok(_) => RateDecision::fail_open(limit),
            Err(error) => {
                tracing::warn!(identifier, %error, "rate limit store unreachable, failing open");
                RateDecision::fail_open(limit)
            }
        }
    }

    /// Atomic check-and-increment over the last `WINDOW_SECONDS`.
    pub async fn check(&self, identifier: &str, limit: i64, increment: i64) -> RateDecision {
        self.run_window(identifier, limit, increment, false).await
    }

    /// Pre-request wrapper: denial becomes a 429 with `retry_after`.
    pub async fn check_or_reject(
        &self,
        identifier: &str,
        limit: i64,
        increment: i64,
    ) -> Result<RateDecision, GatewayError> {
        let decision = self.check(identifier, limit, increment).await;
        if decision.allowed {
            return Ok(decision);
        }
        Err(GatewayError::RateLimited {
            message: format!("rate limit exceeded: {limit} per {WINDOW_SECONDS}s"),
            retry_after: decision.reset_seconds,
        })
    }

    /// Post-request wrapper: unconditionally charge `amount` units (token
    /// buckets are debited after the response is known).
    pub async fn record_usage(&self, identifier: &str, amount: i64) {
        if amount <= 0 {
            return;
        }
        let _ = self.run_window(identifier, i64::MAX, amount, true).await;
    }
}

/// RFC 6585-style headers; `remaining` is clamped at zero upstream.
pub fn rate_limit_headers(
    requests: Option<&RateDecision>,
    tokens: Option<&RateDecision>,
) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for (suffix, decision) in [("requests", requests), ("tokens", tokens)] {
        let Some(decision) = decision else { continue };
        if !decision.enforced {
            continue;
        }
        headers.push((
            format!("x-ratelimit-limit-{suffix}"),
            decision.limit.to_string(),
        ));
        headers.push((
            format!("x-ratelimit-remaining-{suffix}"),
            decision.remaining.to_string(),
        ));
        headers.push((
            format!("x-ratelimit-reset-{suffix}"),
            decision.reset_seconds.to_string(),
        ));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_have_stable_shape() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            rpm_identifier(&id),
            "rpm:key:00000000-0000-0000-0000-000000000000"
        );
        assert!(tpm_identifier(&id).starts_with("tpm:key:"));
    }

    #[test]
    fn headers_skip_unenforced_decisions() {
        let enforced = RateDecision {
            allowed: true,
            limit: 60,
            remaining: 59,
            reset_seconds: 42,
            enforced: true,
        };
        let open = RateDecision::fail_open(60);

        let headers = rate_limit_headers(Some(&enforced), Some(&open));
        assert_eq!(headers.len(), 3);
        assert!(headers.contains(&("x-ratelimit-limit-requests".into(), "60".into())));
        assert!(headers.contains(&("x-ratelimit-remaining-requests".into(), "59".into())));
        assert!(headers.contains(&("x-ratelimit-reset-requests".into(), "42".into())));
    }

    #[test]
    fn headers_cover_both_buckets() {
        let decision = RateDecision {
            allowed: true,
            limit: 100,
            remaining: 0,
            reset_seconds: 1,
            enforced: true,
        };
        let headers = rate_limit_headers(Some(&decision), Some(&decision));
        assert_eq!(headers.len(), 6);
        assert!(headers.iter().any(|(name, _)| name == "x-ratelimit-limit-tokens"));
    }

    #[tokio::test]
    async fn missing_connection_fails_open() {
        let limiter = RateLimiter::new(None, "conduit:");
        let decision = limiter.check("rpm:key:x", 1, 1).await;
        assert!(decision.allowed);
        assert!(!decision.enforced);
        // And the reject wrapper never rejects while failing open.
        assert!(limiter.check_or_reject("rpm:key:x", 1, 1).await.is_ok());
    }
}
