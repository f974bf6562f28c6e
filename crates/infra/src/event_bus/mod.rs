//! Infrastructure event bus implementations.
//!
//! The bus contract and the in-process bus live in `tidemark-events`. This
//! module provides broker-backed buses behind cargo features and the factory
//! that picks one from configuration.

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "redis")]
pub mod redis_pubsub;

use std::sync::Arc;

use tracing::info;

use tidemark_events::{BusError, EventBus, InMemoryEventBus};

use crate::config::{BusConfig, MessagingSettings};

#[cfg(feature = "kafka")]
pub use kafka::KafkaEventBus;
#[cfg(feature = "nats")]
pub use nats::NatsEventBus;
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubEventBus;

/// Build the bus selected by `settings.type`.
pub async fn new_event_bus(settings: &MessagingSettings) -> Result<Arc<dyn EventBus>, BusError> {
    let config = BusConfig::from_settings(settings).map_err(|e| BusError::config(e.to_string()))?;
    connect_event_bus(&config).await
}

/// Build the bus described by an already validated `config`.
pub async fn connect_event_bus(config: &BusConfig) -> Result<Arc<dyn EventBus>, BusError> {
    let bus: Arc<dyn EventBus> = match config {
        BusConfig::Memory { partitions } => Arc::new(InMemoryEventBus::with_partitions(*partitions)),

        #[cfg(feature = "kafka")]
        BusConfig::Kafka(settings) => Arc::new(KafkaEventBus::connect(settings.clone())?),
        #[cfg(not(feature = "kafka"))]
        BusConfig::Kafka(_) => return Err(compiled_out("kafka")),

        #[cfg(feature = "nats")]
        BusConfig::Nats(settings) => Arc::new(NatsEventBus::connect(settings.clone()).await?),
        #[cfg(not(feature = "nats"))]
        BusConfig::Nats(_) => return Err(compiled_out("nats")),

        #[cfg(feature = "redis")]
        BusConfig::Redis(settings) => Arc::new(RedisPubSubEventBus::connect(settings.clone()).await?),
        #[cfg(not(feature = "redis"))]
        BusConfig::Redis(_) => return Err(compiled_out("redis")),
    };

    info!(backend = bus.backend(), "event bus ready");
    Ok(bus)
}

#[allow(dead_code)]
fn compiled_out(backend: &str) -> BusError {
    BusError::config(format!(
        "message queue type '{backend}' requires the `{backend}` feature"
    ))
}
