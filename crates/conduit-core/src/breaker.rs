//! Per-deployment circuit breaker.
//!
//! State is derived from the deployment row, never cached in memory, so
//! every worker process observes the same circuit:
//!
//! - CLOSED:    healthy, requests flow
//! - OPEN:      unhealthy and cooling down, requests rejected
//! - HALF_OPEN: cooldown expired, one probe allowed
//!
//! Transitions are pure functions over the observed row; the caller flushes
//! the returned [`HealthUpdate`]. Racing writers converge because each
//! transition writes the complete health triple.

use time::{Duration, OffsetDateTime};

use conduit_common::config::BreakerSettings;
use conduit_storage::HealthUpdate;
use conduit_storage::entities::deployments;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub fn state(deployment: &deployments::Model, now: OffsetDateTime) -> CircuitState {
    if deployment.is_healthy {
        return CircuitState::Closed;
    }
    match deployment.cooldown_until {
        Some(cooldown_until) if cooldown_until > now => CircuitState::Open,
        _ => CircuitState::HalfOpen,
    }
}

pub fn is_available(deployment: &deployments::Model, now: OffsetDateTime) -> bool {
    state(deployment, now) != CircuitState::Open
}

/// Success closes the circuit and zeroes the failure counter. Returns
/// `None` when the row already reflects a closed, clean circuit.
pub fn on_success(deployment: &deployments::Model) -> Option<HealthUpdate> {
    if deployment.consecutive_failures == 0 && deployment.is_healthy {
        return None;
    }
    Some(HealthUpdate {
        is_healthy: true,
        consecutive_failures: 0,
        cooldown_until: None,
    })
}

/// Failure bumps the counter; at the threshold the circuit opens, and a
/// failed HALF_OPEN probe re-opens with doubled cooldown.
pub fn on_failure(
    deployment: &deployments::Model,
    now: OffsetDateTime,
    settings: &BreakerSettings,
) -> HealthUpdate {
    let failures = deployment.consecutive_failures + 1;

    if state(deployment, now) == CircuitState::HalfOpen {
        return HealthUpdate {
            is_healthy: false,
            consecutive_failures: failures,
            cooldown_until: Some(now + Duration::seconds(settings.cooldown_seconds * 2)),
        };
    }

    if failures >= settings.failure_threshold {
        return HealthUpdate {
            is_healthy: false,
            consecutive_failures: failures,
            cooldown_until: Some(now + Duration::seconds(settings.cooldown_seconds)),
        };
    }

    HealthUpdate {
        is_healthy: deployment.is_healthy,
        consecutive_failures: failures,
        cooldown_until: deployment.cooldown_until,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            cooldown_seconds: 60,
        }
    }

    fn deployment(
        is_healthy: bool,
        consecutive_failures: i32,
        cooldown_until: Option<OffsetDateTime>,
    ) -> deployments::Model {
        let now = OffsetDateTime::now_utc();
        deployments::Model {
            id: Uuid::new_v4(),
            name: "d".into(),
            provider: "openai".into(),
            model_name: "gpt-4o".into(),
            api_base: "https://example".into(),
            api_key_encrypted: String::new(),
            priority: 1,
            weight: 100,
            is_active: true,
            is_healthy,
            consecutive_failures,
            cooldown_until,
            max_rpm: None,
            max_tpm: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn state_derivation() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(state(&deployment(true, 0, None), now), CircuitState::Closed);
        assert_eq!(
            state(
                &deployment(false, 3, Some(now + Duration::seconds(30))),
                now
            ),
            CircuitState::Open
        );
        assert_eq!(
            state(
                &deployment(false, 3, Some(now - Duration::seconds(1))),
                now
            ),
            CircuitState::HalfOpen
        );
        assert_eq!(state(&deployment(false, 3, None), now), CircuitState::HalfOpen);
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let now = OffsetDateTime::now_utc();
        let settings = settings();

        let second = on_failure(&deployment(true, 1, None), now, &settings);
        assert!(second.is_healthy);
        assert_eq!(second.consecutive_failures, 2);
        assert_eq!(second.cooldown_until, None);

        let third = on_failure(&deployment(true, 2, None), now, &settings);
        assert!(!third.is_healthy);
        assert_eq!(third.consecutive_failures, 3);
        assert_eq!(third.cooldown_until, Some(now + Duration::seconds(60)));
    }

    #[test]
    fn half_open_failure_doubles_cooldown() {
        let now = OffsetDateTime::now_utc();
        let expired = deployment(false, 3, Some(now - Duration::seconds(1)));
        let update = on_failure(&expired, now, &settings());
        assert!(!update.is_healthy);
        assert_eq!(update.cooldown_until, Some(now + Duration::seconds(120)));
    }

    #[test]
    fn success_resets_and_closes() {
        let now = OffsetDateTime::now_utc();
        let open = deployment(false, 4, Some(now + Duration::seconds(30)));
        let update = on_success(&open).unwrap();
        assert!(update.is_healthy);
        assert_eq!(update.consecutive_failures, 0);
        assert_eq!(update.cooldown_until, None);

        // A clean closed circuit needs no write.
        assert!(on_success(&deployment(true, 0, None)).is_none());
        // A closed circuit with stale failures does.
        assert!(on_success(&deployment(true, 2, None)).is_some());
    }

    #[test]
    fn only_open_circuits_shed_load() {
        let now = OffsetDateTime::now_utc();
        assert!(is_available(&deployment(true, 0, None), now));
        assert!(is_available(
            &deployment(false, 3, Some(now - Duration::seconds(5))),
            now
        ));
        assert!(!is_available(
            &deployment(false, 3, Some(now + Duration::seconds(5))),
            now
        ));
    }
}
