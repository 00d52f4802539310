pub mod auth;
pub mod breaker;
pub mod cache;
pub mod cost;
pub mod guardrails;
pub mod kv;
pub mod pipeline;
pub mod prompts;
pub mod rate_limit;
pub mod router;
pub mod streaming;

pub use auth::Principal;
pub use pipeline::{CompletionOutcome, PipelineContext, StreamingOutcome};
