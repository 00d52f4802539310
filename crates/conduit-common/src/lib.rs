pub mod config;
pub mod crypto;
pub mod error;
pub mod tokens;

pub use config::{CacheSettings, ConfigPatch, GatewayConfig, GuardrailSettings, RoutingSettings};
pub use crypto::{CredentialCipher, GeneratedKey, KEY_PREFIX, generate_api_key, hash_api_key};
pub use error::GatewayError;
