use std::time::Duration;

use serde::{Deserialize, Serialize};

use tidemark_core::Transition;

use super::ConfigError;

/// Root of the raw (unvalidated) configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub messaging: MessagingSettings,
    pub storage: StorageSettings,
    pub projection: ProjectionSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Message transport settings. `type` selects the backend; the remaining
/// fields are read by the backends that need them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    /// `memory`, `kafka`, `nats` or `redis`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kafka bootstrap servers.
    pub brokers: Vec<String>,
    /// NATS or Redis server URL.
    pub url: String,
    /// Topic the ingest worker consumes.
    pub topic: String,
    /// Kafka consumer group. Offsets are committed only when set.
    pub group_id: Option<String>,
    /// NATS queue group for load-balanced subscriptions.
    pub queue_group: Option<String>,
    /// Lanes per topic for the in-process bus.
    pub partitions: usize,
    pub publish_timeout_ms: u64,
    /// Kafka producer retries.
    pub retries: u32,
    /// `latest` or `earliest`.
    pub start_offset: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            brokers: Vec::new(),
            url: String::new(),
            topic: "events".to_string(),
            group_id: None,
            queue_group: None,
            partitions: 4,
            publish_timeout_ms: 5_000,
            retries: 5,
            start_offset: "latest".to_string(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }
}

impl MessagingSettings {
    /// Settings for a given backend with everything else defaulted.
    pub fn of_type(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Event store settings. `type` selects the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// `memory`, `postgres` or `mysql`.
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
    /// Create the `events` table on startup.
    pub migrate: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            host: String::new(),
            port: 0,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            max_connections: 10,
            migrate: true,
        }
    }
}

/// One `event type -> lifecycle transition` entry of the dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub event_type: String,
    pub transition: Transition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionSettings {
    /// Lanes used when applying a batch.
    pub workers: usize,
    pub transitions: Vec<TransitionRule>,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            transitions: vec![
                TransitionRule {
                    event_type: "EventType1".to_string(),
                    transition: Transition::Activate,
                },
                TransitionRule {
                    event_type: "EventType2".to_string(),
                    transition: Transition::Update,
                },
            ],
        }
    }
}

impl ProjectionSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("projection", "workers", "must be at least 1"));
        }
        if let Some(rule) = self.transitions.iter().find(|r| r.event_type.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "projection",
                "transitions",
                format!("empty event type for {:?}", rule.transition),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `json` or `pretty`.
    pub format: String,
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            filter: "info".to_string(),
        }
    }
}
