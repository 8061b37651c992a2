//! Configuration loading, validation and env substitution.
//!
//! Config files: `relay.toml`, `relay.yaml`, `relay.yml` or `relay.json`,
//! searched in `./` then `~/.config/relay/`.
//!
//! Supports `${ENV_VAR}` substitution anywhere in the raw text.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        config_dir, data_dir, discover_and_load, find_config_file, history_db_url, history_path,
        load_config,
    },
    schema::{
        AntiSpamConfig, ApplicationConfig, DeliveryConfig, ForwarderConfig, HashtagConfig,
        HistoryBackend, HistoryConfig, LoggingConfig, MediaConfig, MentionOverrideConfig,
        MentionsConfig, RelayConfig, SourceConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate, validate_config, validate_str},
};
