use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tidemark_core::{DomainError, Event, TimeRange};

/// Event store operation error.
///
/// Every variant that comes from the storage layer carries the operation and
/// the aggregate (or event) it concerned. Stores never retry internally.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The event failed structural validation before reaching storage.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] DomainError),

    /// An event with this id was already appended.
    #[error("event '{id}' already exists")]
    Duplicate { id: String },

    /// Storage could not be reached (pool closed, IO, timeouts).
    #[error("{operation} for {context}: storage unavailable: {reason}")]
    Unavailable {
        operation: &'static str,
        context: String,
        reason: String,
    },

    /// Storage was reached but refused or failed the operation.
    #[error("{operation} for {context} failed: {reason}")]
    Rejected {
        operation: &'static str,
        context: String,
        reason: String,
    },
}

impl EventStoreError {
    pub fn unavailable(operation: &'static str, context: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            operation,
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn rejected(operation: &'static str, context: impl Into<String>, reason: impl ToString) -> Self {
        Self::Rejected {
            operation,
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EventStoreError::Duplicate { .. })
    }
}

/// Context string used in errors for aggregate-scoped operations.
pub(crate) fn aggregate_context(aggregate_id: &str) -> String {
    format!("aggregate '{aggregate_id}'")
}

/// Context string used in errors for event-scoped operations.
pub(crate) fn event_context(id: &str) -> String {
    format!("event '{id}'")
}

/// Append-only event log, partitioned by aggregate.
///
/// ## Append Semantics
///
/// `save_event()`:
/// - validates the event (non-empty id, aggregate id and type)
/// - rejects an id that was already appended with [`EventStoreError::Duplicate`]
/// - appends; there is no update or delete
///
/// ## Read Semantics
///
/// `get_events()` returns an aggregate's history ordered by `timestamp`
/// ascending, ties broken by insertion order. It is the single read path:
/// `query_events()` and `get_events_between()` are defined in terms of it
/// unless a backend can push the same ordering down into storage.
///
/// An aggregate with no events yields an empty vector, not an error.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn save_event(&self, event: &Event) -> Result<(), EventStoreError>;

    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError>;

    /// Same contract as [`EventStore::get_events`].
    async fn query_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.get_events(aggregate_id).await
    }

    /// The ordered history restricted to `range`.
    async fn get_events_between(
        &self,
        aggregate_id: &str,
        range: TimeRange,
    ) -> Result<Vec<Event>, EventStoreError> {
        let events = self.get_events(aggregate_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| range.contains(e.timestamp))
            .collect())
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>, EventStoreError>;

    /// Every aggregate id with at least one event, sorted.
    async fn aggregate_ids(&self) -> Result<Vec<String>, EventStoreError>;

    /// Release connections. Further calls fail with `Unavailable`.
    async fn close(&self) {}
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn save_event(&self, event: &Event) -> Result<(), EventStoreError> {
        (**self).save_event(event).await
    }

    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
        (**self).get_events(aggregate_id).await
    }

    async fn query_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
        (**self).query_events(aggregate_id).await
    }

    async fn get_events_between(
        &self,
        aggregate_id: &str,
        range: TimeRange,
    ) -> Result<Vec<Event>, EventStoreError> {
        (**self).get_events_between(aggregate_id, range).await
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>, EventStoreError> {
        (**self).get_event(id).await
    }

    async fn aggregate_ids(&self) -> Result<Vec<String>, EventStoreError> {
        (**self).aggregate_ids().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
