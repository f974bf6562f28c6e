//! Validated, per-backend configuration.

use std::str::FromStr;
use std::time::Duration;

use super::settings::{MessagingSettings, StorageSettings};
use super::ConfigError;

/// Where a new Kafka subscription starts reading.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum StartOffset {
    /// Only messages produced after the subscription is established.
    #[default]
    Latest,
    Earliest,
}

impl FromStr for StartOffset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "latest" | "newest" => Ok(StartOffset::Latest),
            "earliest" | "oldest" => Ok(StartOffset::Earliest),
            other => Err(ConfigError::invalid(
                "messaging",
                "start_offset",
                format!("expected 'latest' or 'earliest', got '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub group_id: Option<String>,
    pub publish_timeout: Duration,
    pub retries: u32,
    pub start_offset: StartOffset,
    /// PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL.
    pub security_protocol: Option<String>,
    /// PLAIN, SCRAM-SHA-256, SCRAM-SHA-512.
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl KafkaSettings {
    pub fn new<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            group_id: None,
            publish_timeout: Duration::from_secs(5),
            retries: 5,
            start_offset: StartOffset::Latest,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_start_offset(mut self, offset: StartOffset) -> Self {
        self.start_offset = offset;
        self
    }

    /// Add SASL authentication (implies `SASL_SSL`).
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Comma-separated bootstrap server list.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::missing("messaging", "brokers"));
        }
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::invalid("messaging", "publish_timeout_ms", "must be positive"));
        }
        if self.sasl_username.is_some() && self.sasl_password.is_none() {
            return Err(ConfigError::missing("messaging", "sasl_password"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsSettings {
    pub url: String,
    pub queue_group: Option<String>,
    pub publish_timeout: Duration,
}

impl NatsSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue_group: None,
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::missing("messaging", "url"));
        }
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::invalid("messaging", "publish_timeout_ms", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub url: String,
    pub publish_timeout: Duration,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::missing("messaging", "url"));
        }
        Ok(())
    }
}

/// Event bus configuration, one variant per backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusConfig {
    Memory { partitions: usize },
    Kafka(KafkaSettings),
    Nats(NatsSettings),
    Redis(RedisSettings),
}

impl BusConfig {
    /// Select and validate the backend named by `settings.kind`.
    pub fn from_settings(settings: &MessagingSettings) -> Result<Self, ConfigError> {
        let timeout = settings.publish_timeout();
        let config = match settings.kind.trim().to_ascii_lowercase().as_str() {
            "" => return Err(ConfigError::missing("messaging", "type")),
            "memory" | "in-memory" => BusConfig::Memory {
                partitions: settings.partitions,
            },
            "kafka" => BusConfig::Kafka(KafkaSettings {
                brokers: settings.brokers.clone(),
                group_id: settings.group_id.clone(),
                publish_timeout: timeout,
                retries: settings.retries,
                start_offset: settings.start_offset.parse()?,
                security_protocol: settings.security_protocol.clone(),
                sasl_mechanism: settings.sasl_mechanism.clone(),
                sasl_username: settings.sasl_username.clone(),
                sasl_password: settings.sasl_password.clone(),
            }),
            "nats" => BusConfig::Nats(NatsSettings {
                url: settings.url.clone(),
                queue_group: settings.queue_group.clone(),
                publish_timeout: timeout,
            }),
            "redis" => BusConfig::Redis(RedisSettings {
                url: settings.url.clone(),
                publish_timeout: timeout,
            }),
            other => {
                return Err(ConfigError::Unsupported {
                    kind: "message queue",
                    value: other.to_string(),
                });
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn backend(&self) -> &'static str {
        match self {
            BusConfig::Memory { .. } => "memory",
            BusConfig::Kafka(_) => "kafka",
            BusConfig::Nats(_) => "nats",
            BusConfig::Redis(_) => "redis",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            BusConfig::Memory { partitions } if *partitions == 0 => Err(ConfigError::invalid(
                "messaging",
                "partitions",
                "must be at least 1",
            )),
            BusConfig::Memory { .. } => Ok(()),
            BusConfig::Kafka(k) => k.validate(),
            BusConfig::Nats(n) => n.validate(),
            BusConfig::Redis(r) => r.validate(),
        }
    }
}

/// Relational database connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl DbSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::missing("storage", "host"));
        }
        if self.port == 0 {
            return Err(ConfigError::missing("storage", "port"));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::missing("storage", "user"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::missing("storage", "password"));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::missing("storage", "database"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("storage", "max_connections", "must be at least 1"));
        }
        Ok(())
    }
}

/// Event store configuration, one variant per backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Postgres(DbSettings),
    MySql(DbSettings),
}

impl StoreConfig {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self, ConfigError> {
        let db = || DbSettings {
            host: settings.host.clone(),
            port: settings.port,
            user: settings.user.clone(),
            password: settings.password.clone(),
            database: settings.database.clone(),
            max_connections: settings.max_connections,
        };

        let config = match settings.kind.trim().to_ascii_lowercase().as_str() {
            "" => return Err(ConfigError::missing("storage", "type")),
            "memory" | "in-memory" => StoreConfig::Memory,
            "postgres" | "postgresql" => StoreConfig::Postgres(db()),
            "mysql" => StoreConfig::MySql(db()),
            other => {
                return Err(ConfigError::Unsupported {
                    kind: "database",
                    value: other.to_string(),
                });
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn backend(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::Postgres(_) => "postgres",
            StoreConfig::MySql(_) => "mysql",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StoreConfig::Memory => Ok(()),
            StoreConfig::Postgres(db) | StoreConfig::MySql(db) => db.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_settings(kind: &str) -> StorageSettings {
        StorageSettings {
            kind: kind.to_string(),
            host: "localhost".to_string(),
            port: 5432,
            user: "tidemark".to_string(),
            password: "secret".to_string(),
            database: "events".to_string(),
            ..StorageSettings::default()
        }
    }

    #[test]
    fn unknown_bus_type_is_unsupported() {
        let err = BusConfig::from_settings(&MessagingSettings::of_type("carrier-pigeon")).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Unsupported {
                kind: "message queue",
                value: "carrier-pigeon".to_string()
            }
        );
    }

    #[test]
    fn empty_bus_type_is_missing() {
        let err = BusConfig::from_settings(&MessagingSettings::of_type("  ")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { field: "type", .. }));
    }

    #[test]
    fn kafka_requires_brokers() {
        let err = BusConfig::from_settings(&MessagingSettings::of_type("kafka")).unwrap_err();
        assert_eq!(err, ConfigError::missing("messaging", "brokers"));

        let mut s = MessagingSettings::of_type("Kafka");
        s.brokers = vec!["localhost:9092".to_string()];
        s.group_id = Some("projector".to_string());
        s.start_offset = "earliest".to_string();
        match BusConfig::from_settings(&s).unwrap() {
            BusConfig::Kafka(k) => {
                assert_eq!(k.bootstrap_servers(), "localhost:9092");
                assert_eq!(k.group_id.as_deref(), Some("projector"));
                assert_eq!(k.start_offset, StartOffset::Earliest);
                assert_eq!(k.publish_timeout, Duration::from_secs(5));
            }
            other => panic!("expected kafka, got {other:?}"),
        }
    }

    #[test]
    fn nats_and_redis_require_a_url() {
        for kind in ["nats", "redis"] {
            let err = BusConfig::from_settings(&MessagingSettings::of_type(kind)).unwrap_err();
            assert_eq!(err, ConfigError::missing("messaging", "url"), "{kind}");

            let mut s = MessagingSettings::of_type(kind);
            s.url = "nats://localhost:4222".to_string();
            assert_eq!(BusConfig::from_settings(&s).unwrap().backend(), kind);
        }
    }

    #[test]
    fn memory_bus_needs_at_least_one_partition() {
        let mut s = MessagingSettings::of_type("memory");
        assert_eq!(
            BusConfig::from_settings(&s).unwrap(),
            BusConfig::Memory { partitions: 4 }
        );
        s.partitions = 0;
        assert!(BusConfig::from_settings(&s).is_err());
    }

    #[test]
    fn bad_start_offset_is_rejected() {
        let mut s = MessagingSettings::of_type("kafka");
        s.brokers = vec!["b:9092".to_string()];
        s.start_offset = "middle".to_string();
        assert!(matches!(
            BusConfig::from_settings(&s),
            Err(ConfigError::Invalid { field: "start_offset", .. })
        ));
    }

    #[test]
    fn sasl_builder_sets_protocol_and_requires_password() {
        let k = KafkaSettings::new(["b:9092"]).with_sasl("user", "pass", "SCRAM-SHA-256");
        assert_eq!(k.security_protocol.as_deref(), Some("SASL_SSL"));
        assert!(k.validate().is_ok());

        let mut k = k;
        k.sasl_password = None;
        assert_eq!(k.validate(), Err(ConfigError::missing("messaging", "sasl_password")));
    }

    #[test]
    fn database_fields_are_checked_in_order() {
        assert!(matches!(
            StoreConfig::from_settings(&db_settings("postgres")),
            Ok(StoreConfig::Postgres(_))
        ));
        assert!(matches!(
            StoreConfig::from_settings(&db_settings("MySQL")),
            Ok(StoreConfig::MySql(_))
        ));

        let mut s = db_settings("postgres");
        s.host.clear();
        s.password.clear();
        assert_eq!(
            StoreConfig::from_settings(&s),
            Err(ConfigError::missing("storage", "host"))
        );

        let mut s = db_settings("mysql");
        s.port = 0;
        assert_eq!(
            StoreConfig::from_settings(&s),
            Err(ConfigError::missing("storage", "port"))
        );
    }

    #[test]
    fn unknown_database_type_is_unsupported() {
        let err = StoreConfig::from_settings(&db_settings("oracle")).unwrap_err();
        assert!(matches!(err, ConfigError::Unsupported { kind: "database", .. }));
        assert_eq!(
            StoreConfig::from_settings(&StorageSettings::default()).unwrap(),
            StoreConfig::Memory
        );
    }
}
