use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use tidemark_events::{EventBus, InMemoryEventBus};
use tidemark_infra::{
    config::{AppConfig, ProjectionSettings, StoreConfig},
    event_bus::new_event_bus,
    event_store::{open_event_store, EventStore, InMemoryEventStore},
    projections::AggregateProjection,
    workers::{start_ingest, IngestHandler},
};

/// Infrastructure shared by every handler.
pub struct AppServices {
    pub store: Arc<dyn EventStore>,
    pub bus: Arc<dyn EventBus>,
    pub projection: Arc<AggregateProjection>,
    /// Topic the ingest worker consumes.
    pub topic: String,
}

impl AppServices {
    /// In-memory wiring (dev/test): store, bus and projection in process.
    pub fn in_memory(projection: &ProjectionSettings) -> Self {
        Self {
            store: Arc::new(InMemoryEventStore::new()),
            bus: Arc::new(InMemoryEventBus::new()),
            projection: Arc::new(AggregateProjection::from_settings(projection)),
            topic: "events".to_string(),
        }
    }

    /// Subscribe the ingest worker to the configured topic.
    pub async fn start_ingest(&self) -> anyhow::Result<()> {
        let handler = IngestHandler::new(self.store.clone()).with_projection(self.projection.clone());
        start_ingest(self.bus.as_ref(), &self.topic, handler)
            .await
            .with_context(|| format!("failed to subscribe ingest worker to '{}'", self.topic))
    }

    /// Stop delivery loops, then release storage.
    pub async fn shutdown(&self) {
        if let Err(err) = self.bus.shutdown().await {
            warn!(error = %err, "event bus shutdown failed");
        }
        self.store.close().await;
        info!("services stopped");
    }
}

/// Build services from validated configuration.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let store_config =
        StoreConfig::from_settings(&config.storage).context("invalid storage configuration")?;
    let store = open_event_store(&store_config, config.storage.migrate)
        .await
        .context("failed to open event store")?;

    let bus = new_event_bus(&config.messaging)
        .await
        .context("failed to create event bus")?;

    config
        .projection
        .validate()
        .context("invalid projection configuration")?;
    let projection = Arc::new(AggregateProjection::from_settings(&config.projection));

    Ok(AppServices {
        store,
        bus,
        projection,
        topic: config.messaging.topic.clone(),
    })
}
