use std::sync::Arc;

use tidemark_core::Event;

/// A projection builds derived read-side state from the event log.
///
/// Read models are **disposable**: they can be cleared and rebuilt from the
/// event store at any time, which is what replay does. Events are the source
/// of truth; projections are optimized views.
///
/// ## Idempotency
///
/// Events reach a projection at least once (bus redelivery, overlapping
/// replays), so applying the same event twice must leave the state as if it
/// had been applied once. Tracking applied event ids per aggregate is the
/// usual strategy.
///
/// ## Unknown events
///
/// Event types a projection does not recognise are skipped silently and
/// leave state untouched. They are not errors.
///
/// ## Concurrency
///
/// Methods take `&self`; implementations guard their state internally so a
/// live subscriber and a replay can share one projection.
pub trait Projection: Send + Sync {
    /// Snapshot type returned by [`Projection::get_state`].
    type State;

    /// Apply one event.
    fn handle_event(&self, event: &Event);

    /// Apply a batch.
    ///
    /// Events of the same aggregate must be applied in non-decreasing
    /// timestamp order regardless of their order in `events`. The default
    /// applies a stable timestamp sort sequentially.
    fn handle_events(&self, mut events: Vec<Event>) {
        events.sort_by_key(|e| e.timestamp);
        for event in &events {
            self.handle_event(event);
        }
    }

    /// A consistent snapshot of the current state.
    fn get_state(&self) -> Self::State;

    /// Discard all state.
    fn clear(&self);

    /// Discard the state of one aggregate.
    fn clear_aggregate(&self, aggregate_id: &str);

    /// Position of the next live event. Replays read it before loading from
    /// the store and hand it back to [`Projection::replace_aggregate`] and
    /// [`Projection::replace_all`], so events applied at or after it survive
    /// the swap. Projections without sequencing return `0`.
    fn watermark(&self) -> u64 {
        0
    }

    /// Swap one aggregate's state for the fold of `events`.
    ///
    /// The default clears and re-applies. It is not atomic: readers may see
    /// the aggregate missing, and live events applied since `since` are lost.
    fn replace_aggregate(&self, aggregate_id: &str, events: Vec<Event>, since: u64) {
        let _ = since;
        self.clear_aggregate(aggregate_id);
        self.handle_events(events);
    }

    /// Swap the whole state for the fold of `events`. Same caveats as
    /// [`Projection::replace_aggregate`].
    fn replace_all(&self, events: Vec<Event>, since: u64) {
        let _ = since;
        self.clear();
        self.handle_events(events);
    }
}

impl<P> Projection for Arc<P>
where
    P: Projection + ?Sized,
{
    type State = P::State;

    fn handle_event(&self, event: &Event) {
        (**self).handle_event(event)
    }

    fn handle_events(&self, events: Vec<Event>) {
        (**self).handle_events(events)
    }

    fn get_state(&self) -> Self::State {
        (**self).get_state()
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn clear_aggregate(&self, aggregate_id: &str) {
        (**self).clear_aggregate(aggregate_id)
    }

    fn watermark(&self) -> u64 {
        (**self).watermark()
    }

    fn replace_aggregate(&self, aggregate_id: &str, events: Vec<Event>, since: u64) {
        (**self).replace_aggregate(aggregate_id, events, since)
    }

    fn replace_all(&self, events: Vec<Event>, since: u64) {
        (**self).replace_all(events, since)
    }
}
