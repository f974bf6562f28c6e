use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use tidemark_core::Event;

use super::r#trait::{aggregate_context, event_context, EventStore, EventStoreError};

#[derive(Debug, Default)]
struct Log {
    /// Per-aggregate history in insertion order.
    streams: BTreeMap<String, Vec<Event>>,
    ids: HashSet<String>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events.
    pub fn len(&self) -> usize {
        self.log.read().map(|l| l.ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_event(&self, event: &Event) -> Result<(), EventStoreError> {
        event.validate()?;

        let mut log = self.log.write().map_err(|_| {
            EventStoreError::unavailable("save_event", aggregate_context(&event.aggregate_id), "lock poisoned")
        })?;

        if !log.ids.insert(event.id.clone()) {
            return Err(EventStoreError::Duplicate {
                id: event.id.clone(),
            });
        }

        log.streams
            .entry(event.aggregate_id.clone())
            .or_default()
            .push(event.clone());

        Ok(())
    }

    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
        let log = self.log.read().map_err(|_| {
            EventStoreError::unavailable("get_events", aggregate_context(aggregate_id), "lock poisoned")
        })?;

        let mut events = log.streams.get(aggregate_id).cloned().unwrap_or_default();
        // Stable: equal timestamps keep insertion order.
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::unavailable("get_event", event_context(id), "lock poisoned"))?;

        if !log.ids.contains(id) {
            return Ok(None);
        }
        Ok(log
            .streams
            .values()
            .flat_map(|s| s.iter())
            .find(|e| e.id == id)
            .cloned())
    }

    async fn aggregate_ids(&self) -> Result<Vec<String>, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::unavailable("aggregate_ids", "all aggregates", "lock poisoned"))?;
        Ok(log.streams.keys().cloned().collect())
    }
}
