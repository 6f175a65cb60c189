//! Configuration loading, validation, and env substitution for the gateway
//! core.
//!
//! Config files: `relay.toml`, `relay.yaml`, or `relay.json`.
//! Searched in `./` then `~/.config/relay-gateway/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in all
//! string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use loader::{
    config_dir, discover_and_load, find_or_default_config_path, load_config, load_config_value,
    save_config,
};
pub use schema::{OpenAiWsConfig, RelayConfig, SchedulerScoreWeights};
pub use validate::{Diagnostic, Severity, ValidationResult, validate};
