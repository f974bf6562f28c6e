//! Configuration loading and representation.
//!
//! Raw settings ([`AppConfig`]) are plain serde structs filled from an
//! optional YAML file layered under `TIDEMARK__`-prefixed environment
//! variables. Before anything is constructed from them they are converted
//! into validated tagged unions ([`BusConfig`], [`StoreConfig`]), so every
//! backend variant checks exactly the fields it needs.
//!
//! ```text
//! TIDEMARK__MESSAGING__TYPE=kafka
//! TIDEMARK__MESSAGING__BROKERS=broker-1:9092,broker-2:9092
//! TIDEMARK__STORAGE__TYPE=postgres
//! TIDEMARK__STORAGE__HOST=db
//! ```

mod cache;
mod settings;
mod validated;

pub use cache::{ConfigCache, ConfigSource, LayeredSource, DEFAULT_TTL};
pub use settings::{
    AppConfig, LoggingSettings, MessagingSettings, ProjectionSettings, ServerSettings,
    StorageSettings, TransitionRule,
};
pub use validated::{
    BusConfig, DbSettings, KafkaSettings, NatsSettings, RedisSettings, StartOffset, StoreConfig,
};

use thiserror::Error;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "TIDEMARK_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TIDEMARK";
/// File consulted when [`CONFIG_ENV_VAR`] is unset (optional).
pub const DEFAULT_CONFIG_FILE: &str = "tidemark.yaml";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported {kind} type '{value}'")]
    Unsupported { kind: &'static str, value: String },

    #[error("{section}: {field} is required")]
    Missing {
        section: &'static str,
        field: &'static str,
    },

    #[error("{section}: invalid {field}: {reason}")]
    Invalid {
        section: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("failed to load configuration: {0}")]
    Source(String),
}

impl ConfigError {
    pub(crate) fn missing(section: &'static str, field: &'static str) -> Self {
        Self::Missing { section, field }
    }

    pub(crate) fn invalid(section: &'static str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            section,
            field,
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::Source(err.to_string())
    }
}

impl AppConfig {
    /// Load from the default layered source (file, then environment).
    pub fn load() -> Result<Self, ConfigError> {
        LayeredSource::from_env().load_now()
    }

    /// Check every section; the first failure wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        BusConfig::from_settings(&self.messaging)?;
        StoreConfig::from_settings(&self.storage)?;
        self.projection.validate()
    }
}
