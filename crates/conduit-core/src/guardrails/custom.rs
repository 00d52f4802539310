//! Operator-defined guardrail rules, evaluated by `rule_type`.

use regex::RegexBuilder;

use conduit_common::tokens::count_tokens;
use conduit_storage::entities::guardrail_rules;

use crate::guardrails::Violation;

const DEFAULT_MAX_TOKENS: i64 = 100_000;
const DEFAULT_TOKENIZER_MODEL: &str = "gpt-4o";

/// Evaluate one stored rule against flattened text. Rules with unknown or
/// builtin-handled types never trigger here.
pub fn evaluate_rule(rule: &guardrail_rules::Model, text: &str) -> Option<Violation> {
    let triggered_details = match rule.rule_type.as_str() {
        "regex" => {
            let pattern = rule.config.get("pattern").and_then(|v| v.as_str())?;
            let regex = RegexBuilder::new(pattern).case_insensitive(true).build().ok()?;
            let found = regex.find(text)?;
            Some(format!(
                "matched pattern: {}",
                found.as_str().chars().take(100).collect::<String>()
            ))
        }
        "word_list" => {
            let words = rule.config.get("words").and_then(|v| v.as_array())?;
            let lowered = text.to_lowercase();
            let hit = words
                .iter()
                .filter_map(|word| word.as_str())
                .find(|word| lowered.contains(&word.to_lowercase()))?;
            Some(format!("matched word: {hit}"))
        }
        "max_tokens" => {
            let max_tokens = rule
                .config
                .get("max_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(DEFAULT_MAX_TOKENS);
            let model = rule
                .config
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_TOKENIZER_MODEL);
            let token_count = count_tokens(text, model) as i64;
            (token_count > max_tokens)
                .then(|| format!("token count {token_count} exceeds limit {max_tokens}"))
        }
        _ => None,
    }?;

    Some(Violation {
        rule: rule.name.clone(),
        rule_type: rule.rule_type.clone(),
        stage: rule.stage.clone(),
        action: rule.action.clone(),
        details: triggered_details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn rule(rule_type: &str, action: &str, config: serde_json::Value) -> guardrail_rules::Model {
        let now = OffsetDateTime::now_utc();
        guardrail_rules::Model {
            id: Uuid::new_v4(),
            name: format!("test-{rule_type}"),
            rule_type: rule_type.into(),
            stage: "pre".into(),
            action: action.into(),
            config,
            priority: 100,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn regex_rules_match_case_insensitively() {
        let rule = rule("regex", "block", json!({"pattern": "secret project \\w+"}));
        let violation = evaluate_rule(&rule, "about SECRET PROJECT alpha").unwrap();
        assert_eq!(violation.action, "block");
        assert!(violation.details.contains("SECRET PROJECT alpha"));
        assert!(evaluate_rule(&rule, "nothing here").is_none());
    }

    #[test]
    fn invalid_regex_never_triggers() {
        let rule = rule("regex", "block", json!({"pattern": "[unclosed"}));
        assert!(evaluate_rule(&rule, "anything [unclosed").is_none());
    }

    #[test]
    fn word_list_rules_match_any_word() {
        let rule = rule("word_list", "warn", json!({"words": ["foo", "BAR"]}));
        let violation = evaluate_rule(&rule, "contains bar somewhere").unwrap();
        assert!(violation.details.contains("BAR"));
        assert!(evaluate_rule(&rule, "clean text").is_none());
    }

    #[test]
    fn max_tokens_rules_use_the_configured_budget() {
        let rule = rule("max_tokens", "block", json!({"max_tokens": 3, "model": "gpt-4o"}));
        assert!(evaluate_rule(&rule, "one two three four five six seven").is_some());
        assert!(evaluate_rule(&rule, "hi").is_none());
    }

    #[test]
    fn unknown_types_are_inert() {
        let rule = rule("pii", "block", json!({}));
        assert!(evaluate_rule(&rule, "john@example.com").is_none());
    }
}
