//! Deployment selection: fetch candidates, drop open circuits, rank with
//! the configured strategy, truncate to the fallback budget.

use rand::Rng;
use time::OffsetDateTime;

use conduit_common::GatewayError;
use conduit_common::config::RoutingSettings;
use conduit_storage::ConduitStorage;
use conduit_storage::entities::deployments;

use crate::breaker;
use crate::cost::PricingTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteStrategy {
    #[default]
    Priority,
    WeightedRoundRobin,
    Cost,
    Latency,
}

impl RouteStrategy {
    /// Unknown names degrade to priority, the safe default.
    pub fn parse(name: &str) -> Self {
        match name {
            "weighted_round_robin" | "round_robin" => Self::WeightedRoundRobin,
            "cost" => Self::Cost,
            "latency" => Self::Latency,
            _ => Self::Priority,
        }
    }
}

/// Rank candidates best-first under the given strategy.
pub fn rank<R: Rng>(
    strategy: RouteStrategy,
    mut deployments: Vec<deployments::Model>,
    pricing: &PricingTable,
    rng: &mut R,
) -> Vec<deployments::Model> {
    match strategy {
        RouteStrategy::Priority => {
            deployments.sort_by_key(|deployment| deployment.priority);
            deployments
        }
        RouteStrategy::WeightedRoundRobin => weighted_order(deployments, rng),
        RouteStrategy::Cost => {
            // Ascending output cost; unknown models rank last.
            deployments.sort_by_key(|deployment| {
                pricing
                    .get(&deployment.model_name)
                    .map(|pricing| pricing.output_cost_per_1m)
                    .ok_or(())
            });
            deployments
        }
        // Latency ranking is not implemented yet; use priority as a proxy.
        RouteStrategy::Latency => {
            deployments.sort_by_key(|deployment| deployment.priority);
            deployments
        }
    }
}

/// Repeated weighted draw without replacement: the first pick follows the
/// weights, later picks drain the remainder.
fn weighted_order<R: Rng>(
    mut remaining: Vec<deployments::Model>,
    rng: &mut R,
) -> Vec<deployments::Model> {
    let total: i64 = remaining.iter().map(|d| i64::from(d.weight.max(0))).sum();
    if total == 0 {
        return remaining;
    }

    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let total: i64 = remaining.iter().map(|d| i64::from(d.weight.max(0))).sum();
        let index = if total == 0 {
            0
        } else {
            let mut roll = rng.random_range(0..total);
            remaining
                .iter()
                .position(|deployment| {
                    let weight = i64::from(deployment.weight.max(0));
                    if roll < weight {
                        true
                    } else {
                        roll -= weight;
                        false
                    }
                })
                .unwrap_or(0)
        };
        ordered.push(remaining.remove(index));
    }
    ordered
}

/// Build the fallback chain for one request.
pub async fn build_chain(
    storage: &ConduitStorage,
    model: &str,
    routing: &RoutingSettings,
    pricing: &PricingTable,
    now: OffsetDateTime,
) -> Result<Vec<deployments::Model>, GatewayError> {
    let configured = storage
        .active_deployments_for_model(model)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

    if configured.is_empty() {
        return Err(GatewayError::NoHealthyDeployment(format!(
            "no deployments registered for model '{model}'"
        )));
    }

    let available: Vec<deployments::Model> = configured
        .into_iter()
        .filter(|deployment| breaker::is_available(deployment, now))
        .collect();

    if available.is_empty() {
        return Err(GatewayError::NoHealthyDeployment(format!(
            "all deployments for model '{model}' are in cooldown"
        )));
    }

    let strategy = RouteStrategy::parse(&routing.strategy);
    let mut chain = rank(strategy, available, pricing, &mut rand::rng());
    chain.truncate(routing.max_retries + 1);

    tracing::debug!(
        model,
        chain_len = chain.len(),
        first = %chain[0].name,
        "routed fallback chain"
    );
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn deployment(name: &str, model: &str, priority: i32, weight: i32) -> deployments::Model {
        let now = OffsetDateTime::now_utc();
        deployments::Model {
            id: Uuid::new_v4(),
            name: name.into(),
            provider: "openai".into(),
            model_name: model.into(),
            api_base: "https://example".into(),
            api_key_encrypted: String::new(),
            priority,
            weight,
            is_active: true,
            is_healthy: true,
            consecutive_failures: 0,
            cooldown_until: None,
            max_rpm: None,
            max_tpm: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn strategy_parsing_degrades_to_priority() {
        assert_eq!(RouteStrategy::parse("priority"), RouteStrategy::Priority);
        assert_eq!(
            RouteStrategy::parse("weighted_round_robin"),
            RouteStrategy::WeightedRoundRobin
        );
        assert_eq!(RouteStrategy::parse("cost"), RouteStrategy::Cost);
        assert_eq!(RouteStrategy::parse("latency"), RouteStrategy::Latency);
        assert_eq!(RouteStrategy::parse("anything"), RouteStrategy::Priority);
    }

    #[test]
    fn priority_ranks_ascending() {
        let ranked = rank(
            RouteStrategy::Priority,
            vec![
                deployment("backup", "gpt-4o", 2, 100),
                deployment("primary", "gpt-4o", 1, 100),
            ],
            &PricingTable::builtin(),
            &mut rand::rng(),
        );
        assert_eq!(ranked[0].name, "primary");
        assert_eq!(ranked[1].name, "backup");
    }

    #[test]
    fn cost_ranks_cheapest_first_and_unknown_last() {
        let ranked = rank(
            RouteStrategy::Cost,
            vec![
                deployment("mystery", "unknown-model", 1, 100),
                deployment("big", "gpt-4o", 1, 100),
                deployment("small", "gpt-4o-mini", 1, 100),
            ],
            &PricingTable::builtin(),
            &mut rand::rng(),
        );
        assert_eq!(ranked[0].name, "small");
        assert_eq!(ranked[1].name, "big");
        assert_eq!(ranked[2].name, "mystery");
    }

    #[test]
    fn weighted_order_keeps_every_candidate() {
        let ranked = rank(
            RouteStrategy::WeightedRoundRobin,
            vec![
                deployment("a", "m", 1, 10),
                deployment("b", "m", 1, 1),
                deployment("c", "m", 1, 0),
            ],
            &PricingTable::builtin(),
            &mut rand::rng(),
        );
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn weighted_first_pick_respects_weights() {
        // With weights 99:1, "heavy" should win the first slot nearly
        // always; over 200 draws it must win a clear majority.
        let mut heavy_first = 0;
        for _ in 0..200 {
            let ranked = rank(
                RouteStrategy::WeightedRoundRobin,
                vec![deployment("light", "m", 1, 1), deployment("heavy", "m", 1, 99)],
                &PricingTable::builtin(),
                &mut rand::rng(),
            );
            if ranked[0].name == "heavy" {
                heavy_first += 1;
            }
        }
        assert!(heavy_first > 150, "heavy won only {heavy_first}/200");
    }

    #[test]
    fn zero_total_weight_keeps_input_order() {
        let ranked = rank(
            RouteStrategy::WeightedRoundRobin,
            vec![deployment("a", "m", 1, 0), deployment("b", "m", 1, 0)],
            &PricingTable::builtin(),
            &mut rand::rng(),
        );
        assert_eq!(ranked[0].name, "a");
        assert_eq!(ranked[1].name, "b");
    }
}
