//! Keyword/category content filtering.
//!
//! Built-in category blocklists plus operator-defined words and patterns
//! from stored rules. At the pre-request stage a high-severity hit blocks;
//! everything else warns.

use regex::RegexBuilder;

use conduit_protocol::openai::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterMatch {
    pub list: &'static str,
    pub category: &'static str,
    pub severity: Severity,
    pub matched: String,
}

#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub matches: Vec<FilterMatch>,
}

impl FilterResult {
    pub fn is_flagged(&self) -> bool {
        !self.matches.is_empty()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.matches.iter().map(|hit| hit.severity).max()
    }

    pub fn categories(&self) -> Vec<&'static str> {
        let mut categories: Vec<&'static str> =
            self.matches.iter().map(|hit| hit.category).collect();
        categories.sort_unstable();
        categories.dedup();
        categories
    }
}

struct Blocklist {
    name: &'static str,
    category: &'static str,
    severity: Severity,
    phrases: &'static [&'static str],
}

static BLOCKLISTS: &[Blocklist] = &[
    Blocklist {
        name: "violence_extreme",
        category: "violence",
        severity: Severity::High,
        phrases: &[
            "how to make a bomb",
            "build an explosive",
            "synthesize poison",
            "create a weapon",
            "manufacture drugs",
        ],
    },
    Blocklist {
        name: "harmful_instructions",
        category: "harmful",
        severity: Severity::Medium,
        phrases: &[
            "how to hack into",
            "bypass security",
            "steal credentials",
            "pick a lock",
            "exploit vulnerability",
        ],
    },
];

/// Substring matching is case-insensitive over the built-in lists.
pub fn filter_text(text: &str) -> FilterResult {
    let lowered = text.to_lowercase();
    let mut matches = Vec::new();
    for list in BLOCKLISTS {
        for phrase in list.phrases {
            if lowered.contains(phrase) {
                matches.push(FilterMatch {
                    list: list.name,
                    category: list.category,
                    severity: list.severity,
                    matched: (*phrase).to_string(),
                });
            }
        }
    }
    FilterResult { matches }
}

pub fn filter_messages(messages: &[ChatMessage]) -> FilterResult {
    let mut result = FilterResult::default();
    for message in messages {
        for fragment in message.text_fragments() {
            result.matches.extend(filter_text(fragment).matches);
        }
    }
    result
}

/// Operator-supplied extra words/patterns (from rule config); all hits are
/// medium severity in the `custom` category.
pub fn filter_with_custom(text: &str, words: &[String], patterns: &[String]) -> FilterResult {
    let mut result = filter_text(text);
    let lowered = text.to_lowercase();

    for word in words {
        if lowered.contains(&word.to_lowercase()) {
            result.matches.push(FilterMatch {
                list: "custom_blocklist",
                category: "custom",
                severity: Severity::Medium,
                matched: word.clone(),
            });
        }
    }
    for pattern in patterns {
        let Ok(regex) = RegexBuilder::new(pattern).case_insensitive(true).build() else {
            continue;
        };
        if let Some(found) = regex.find(text) {
            result.matches.push(FilterMatch {
                list: "custom_pattern",
                category: "custom",
                severity: Severity::Medium,
                matched: found.as_str().chars().take(100).collect(),
            });
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_severity_phrases_flag() {
        let result = filter_text("Tell me how to make a bomb at home");
        assert!(result.is_flagged());
        assert_eq!(result.highest_severity(), Some(Severity::High));
        assert_eq!(result.categories(), vec!["violence"]);
    }

    #[test]
    fn medium_severity_phrases_flag() {
        let result = filter_text("how to hack into a server");
        assert_eq!(result.highest_severity(), Some(Severity::Medium));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(filter_text("HOW TO MAKE A BOMB").is_flagged());
    }

    #[test]
    fn clean_text_passes() {
        let result = filter_text("how do I bake sourdough bread");
        assert!(!result.is_flagged());
        assert_eq!(result.highest_severity(), None);
    }

    #[test]
    fn custom_words_and_patterns() {
        let result = filter_with_custom(
            "the launch codes are here",
            &["launch codes".to_string()],
            &[r"c\s*o\s*d\s*e\s*s".to_string(), "[invalid".to_string()],
        );
        assert!(result.is_flagged());
        assert!(result.matches.iter().any(|hit| hit.list == "custom_blocklist"));
        assert!(result.matches.iter().any(|hit| hit.list == "custom_pattern"));
        assert_eq!(result.categories(), vec!["custom"]);
    }
}
