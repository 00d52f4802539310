//! Prompt template validation and `{{variable}}` substitution.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as JsonValue;

use conduit_common::GatewayError;

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("template variable pattern"));

/// Variables referenced by a template, in first-appearance order.
pub fn detect_variables(template: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut variables = Vec::new();
    for captures in VARIABLE.captures_iter(template) {
        let name = captures[1].to_string();
        if seen.insert(name.clone()) {
            variables.push(name);
        }
    }
    variables
}

/// Substitute every `{{variable}}`; a referenced variable missing from
/// `values` is a validation error.
pub fn render(template: &str, values: &JsonValue) -> Result<String, GatewayError> {
    let mut missing = Vec::new();
    let rendered = VARIABLE.replace_all(template, |captures: &regex::Captures<'_>| {
        let name = &captures[1];
        match values.get(name) {
            Some(JsonValue::String(value)) => value.clone(),
            Some(value) => value.to_string(),
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        return Err(GatewayError::Validation {
            message: format!("missing template variables: {}", missing.join(", ")),
            details: serde_json::json!({ "missing": missing }),
        });
    }
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_variables_once_in_order() {
        let variables = detect_variables("Hi {{name}}, {{greeting}} {{name}}!");
        assert_eq!(variables, vec!["name", "greeting"]);
        assert!(detect_variables("no placeholders").is_empty());
    }

    #[test]
    fn renders_strings_and_values() {
        let rendered = render(
            "Hello {{name}}, you have {{count}} messages",
            &json!({"name": "Ada", "count": 3}),
        )
        .unwrap();
        assert_eq!(rendered, "Hello Ada, you have 3 messages");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let rendered = render("{{ name }}", &json!({"name": "Ada"})).unwrap();
        assert_eq!(rendered, "Ada");
    }

    #[test]
    fn missing_variables_error() {
        let err = render("Hello {{name}}", &json!({})).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(err.wire_body()["error"]["details"]["missing"][0], "name");
    }
}
