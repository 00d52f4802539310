//! Per-request cost from the model pricing table.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::{Decimal, dec};
use serde::Deserialize;

const BUILTIN_PRICING: &str = include_str!("pricing.json");
const USD_SCALE: u32 = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_1m: Decimal,
    pub output_cost_per_1m: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Compiled-in defaults; always parse.
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_PRICING).expect("embedded pricing table")
    }

    /// Builtin table with an optional operator override file merged on top.
    pub fn load(override_path: Option<&Path>) -> Self {
        let mut table = Self::builtin();
        let Some(path) = override_path else {
            return table;
        };
        match std::fs::read_to_string(path).map_err(|err| err.to_string()).and_then(|raw| {
            serde_json::from_str::<PricingTable>(&raw).map_err(|err| err.to_string())
        }) {
            Ok(overrides) => table.models.extend(overrides.models),
            Err(error) => {
                tracing::warn!(path = %path.display(), error, "ignoring unreadable pricing file");
            }
        }
        table
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }
}

/// Cost in USD for one request, quantized to 8 decimal places. Unknown
/// models cost zero.
pub fn calculate_cost(
    table: &PricingTable,
    model: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
) -> Decimal {
    let Some(pricing) = table.get(model) else {
        return Decimal::ZERO;
    };
    let per_million = dec!(1_000_000);
    let input = pricing.input_cost_per_1m * Decimal::from(prompt_tokens) / per_million;
    let output = pricing.output_cost_per_1m * Decimal::from(completion_tokens) / per_million;
    (input + output).round_dp(USD_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_parses() {
        let table = PricingTable::builtin();
        assert!(table.get("gpt-4o").is_some());
        assert!(table.get("gemini-2.0-flash").is_some());
    }

    #[test]
    fn unknown_model_costs_zero() {
        let table = PricingTable::builtin();
        assert_eq!(calculate_cost(&table, "not-a-model", 1000, 1000), Decimal::ZERO);
    }

    #[test]
    fn cost_is_quantized_to_eight_places() {
        let table = PricingTable::builtin();
        // gpt-4o: 2.50 in / 10.00 out per 1M.
        let cost = calculate_cost(&table, "gpt-4o", 1000, 500);
        assert_eq!(cost, dec!(0.0075));
        assert!(cost.scale() <= USD_SCALE);

        let tiny = calculate_cost(&table, "gpt-4o-mini", 1, 0);
        assert_eq!(tiny, dec!(0.00000015));
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        let table = PricingTable::builtin();
        assert_eq!(calculate_cost(&table, "gpt-4o", 0, 0), Decimal::ZERO);
    }
}
