pub mod api_keys;
pub mod audit_events;
pub mod cache_entries;
pub mod deployments;
pub mod guardrail_rules;
pub mod prompt_templates;
pub mod request_logs;

pub use api_keys::Entity as ApiKeys;
pub use audit_events::Entity as AuditEvents;
pub use cache_entries::Entity as CacheEntries;
pub use deployments::Entity as Deployments;
pub use guardrail_rules::Entity as GuardrailRules;
pub use prompt_templates::Entity as PromptTemplates;
pub use request_logs::Entity as RequestLogs;
