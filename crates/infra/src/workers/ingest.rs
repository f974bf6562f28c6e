//! Bus-to-store ingest worker.
//!
//! Every event delivered on the ingest topic is persisted and then applied to
//! the live projection. Redeliveries are expected: an event whose id is
//! already stored counts as ingested and is still handed to the projection,
//! which skips ids it has applied.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use tidemark_core::Event;
use tidemark_events::{BusError, EventBus, EventHandler, HandlerError, Projection};

use crate::event_store::{EventStore, EventStoreError};

/// Callback applying a persisted event to a read model.
pub type ApplyEventFn = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handler persisting delivered events.
pub struct IngestHandler {
    store: Arc<dyn EventStore>,
    apply: Option<ApplyEventFn>,
}

impl IngestHandler {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store, apply: None }
    }

    /// Feed persisted events to `projection`.
    pub fn with_projection<P>(mut self, projection: Arc<P>) -> Self
    where
        P: Projection + ?Sized + 'static,
    {
        self.apply = Some(Arc::new(move |event: &Event| projection.handle_event(event)));
        self
    }
}

impl std::fmt::Debug for IngestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestHandler")
            .field("projection", &self.apply.is_some())
            .finish()
    }
}

#[async_trait]
impl EventHandler for IngestHandler {
    async fn handle(&self, mut event: Event) -> Result<(), HandlerError> {
        event.fill_defaults();

        match self.store.save_event(&event).await {
            Ok(()) => {}
            Err(EventStoreError::Duplicate { id }) => {
                debug!(event_id = %id, "event already stored; treating redelivery as ingested");
            }
            Err(err) => return Err(HandlerError::new(err.to_string())),
        }

        if let Some(apply) = &self.apply {
            apply(&event);
        }
        Ok(())
    }
}

/// Subscribe an [`IngestHandler`] to `topic`.
pub async fn start_ingest<B>(bus: &B, topic: &str, handler: IngestHandler) -> Result<(), BusError>
where
    B: EventBus + ?Sized,
{
    bus.consumer_event(topic, Arc::new(handler)).await?;
    info!(backend = bus.backend(), topic, "ingest worker subscribed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tidemark_core::{AggregateStatus, Transition, UNSET_TIMESTAMP};
    use tidemark_events::InMemoryEventBus;

    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::{AggregateProjection, DispatchTable};

    fn projection() -> Arc<AggregateProjection> {
        let table = DispatchTable::new()
            .with("EventType1", Transition::Activate)
            .with("EventType2", Transition::Update);
        Arc::new(AggregateProjection::new(table, 2))
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn persists_and_projects_published_events() {
        let bus = InMemoryEventBus::with_partitions(2);
        let store = Arc::new(InMemoryEventStore::new());
        let p = projection();

        let handler = IngestHandler::new(store.clone()).with_projection(p.clone());
        start_ingest(&bus, "events", handler).await.unwrap();

        bus.publish("events", &Event::new("a1", "EventType1", "x").with_id("e1").at(1))
            .await
            .unwrap();
        bus.publish("events", &Event::new("a1", "EventType2", "y").with_id("e2").at(2))
            .await
            .unwrap();

        eventually(|| p.get("a1").is_some_and(|v| v.version == 2)).await;
        let view = p.get("a1").unwrap();
        assert_eq!(view.status, AggregateStatus::Active);
        assert_eq!(view.data.as_deref(), Some("y"));
        assert_eq!(store.get_events("a1").await.unwrap().len(), 2);

        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn redelivery_is_ingested_once() {
        let store = Arc::new(InMemoryEventStore::new());
        let p = projection();
        let handler = IngestHandler::new(store.clone()).with_projection(p.clone());

        let event = Event::new("a1", "EventType1", "x").with_id("e1").at(1);
        handler.handle(event.clone()).await.unwrap();
        handler.handle(event).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(p.get("a1").unwrap().version, 1);
    }

    #[tokio::test]
    async fn missing_id_and_timestamp_are_assigned() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = IngestHandler::new(store.clone());

        let bare = Event {
            id: String::new(),
            timestamp: UNSET_TIMESTAMP,
            ..Event::new("a1", "EventType1", "x")
        };
        handler.handle(bare).await.unwrap();

        let stored = store.get_events("a1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].id.is_empty());
        assert!(stored[0].timestamp > 0);
    }

    #[tokio::test]
    async fn invalid_events_are_reported_and_not_projected() {
        let store = Arc::new(InMemoryEventStore::new());
        let p = projection();
        let handler = IngestHandler::new(store.clone()).with_projection(p.clone());

        let err = handler.handle(Event::new("", "EventType1", "x")).await.unwrap_err();
        assert!(err.to_string().contains("invalid event"));
        assert!(store.is_empty());
        assert!(p.is_empty());
    }
}
