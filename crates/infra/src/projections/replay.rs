//! Projection replay tooling for rebuilding read models from the event store.
//!
//! - [`replay_events`] replaces one aggregate's state with the fold of its
//!   stored history.
//! - [`replay_window`] re-applies the events of a half-open time window on
//!   top of the current state; replaying adjacent windows in order converges
//!   to the same state as one full replay.
//! - [`replay_all`] rebuilds the projection from every stored aggregate.
//! - [`spawn_rebuild`] runs the same rebuild on a background task and returns
//!   a [`RebuildHandle`] for progress reporting and cancellation.
//!
//! Full and per-aggregate replays read the projection's watermark before
//! loading and swap the result in through `replace_all`/`replace_aggregate`.
//! Nothing is touched until every event is loaded, so a storage failure or a
//! cancellation leaves the existing state in place, and events applied live
//! while the store was being read are kept.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use tidemark_core::{Event, TimeRange};
use tidemark_events::Projection;

use crate::event_store::{EventStore, EventStoreError};

const COMPLETION_POLL: Duration = Duration::from_millis(25);

/// Error type for projection replay operations.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("replay cancelled")]
    Cancelled,

    #[error("replay failed: {0}")]
    Failed(String),
}

/// Totals of a completed full replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub aggregates: u64,
    pub events: u64,
}

/// Re-apply the full history of `aggregate_id`. Returns the number of
/// events handed to the projection.
#[instrument(skip(store, projection), err)]
pub async fn replay_events<S, P>(
    store: &S,
    projection: &P,
    aggregate_id: &str,
) -> Result<usize, ReplayError>
where
    S: EventStore + ?Sized,
    P: Projection + ?Sized,
{
    let since = projection.watermark();
    let events = store.get_events(aggregate_id).await?;
    let count = events.len();
    projection.replace_aggregate(aggregate_id, events, since);
    Ok(count)
}

/// Re-apply the events of `aggregate_id` whose timestamp falls in `range`.
#[instrument(skip(store, projection), err)]
pub async fn replay_window<S, P>(
    store: &S,
    projection: &P,
    aggregate_id: &str,
    range: TimeRange,
) -> Result<usize, ReplayError>
where
    S: EventStore + ?Sized,
    P: Projection + ?Sized,
{
    let events = store.get_events_between(aggregate_id, range).await?;
    let count = events.len();
    projection.handle_events(events);
    Ok(count)
}

/// Rebuild `projection` from every aggregate in `store`.
#[instrument(skip(store, projection), err)]
pub async fn replay_all<S, P>(store: &S, projection: &P) -> Result<ReplaySummary, ReplayError>
where
    S: EventStore + ?Sized,
    P: Projection + ?Sized,
{
    let since = projection.watermark();
    let streams = load_all(store, None).await?;
    let summary = summarize(&streams);

    projection.replace_all(flatten(streams), since);

    info!(aggregates = summary.aggregates, events = summary.events, "projection rebuilt");
    Ok(summary)
}

async fn load_all<S>(
    store: &S,
    cancellation: Option<&AtomicBool>,
) -> Result<Vec<(String, Vec<Event>)>, ReplayError>
where
    S: EventStore + ?Sized,
{
    let ids = store.aggregate_ids().await?;
    let mut streams = Vec::with_capacity(ids.len());
    for id in ids {
        if cancellation.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(ReplayError::Cancelled);
        }
        let events = store.get_events(&id).await?;
        streams.push((id, events));
    }
    Ok(streams)
}

fn flatten(streams: Vec<(String, Vec<Event>)>) -> Vec<Event> {
    streams.into_iter().flat_map(|(_, events)| events).collect()
}

fn summarize(streams: &[(String, Vec<Event>)]) -> ReplaySummary {
    ReplaySummary {
        aggregates: streams.len() as u64,
        events: streams.iter().map(|(_, e)| e.len() as u64).sum(),
    }
}

/// Progress information for a running rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayProgress {
    pub total_aggregates: u64,
    pub total_events: u64,
    pub processed_aggregates: u64,
    pub processed_events: u64,
    pub phase: ReplayPhase,
    pub is_complete: bool,
    pub error: Option<String>,
}

impl ReplayProgress {
    fn started() -> Self {
        Self {
            total_aggregates: 0,
            total_events: 0,
            processed_aggregates: 0,
            processed_events: 0,
            phase: ReplayPhase::Loading,
            is_complete: false,
            error: None,
        }
    }
}

/// Phase of a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    Loading,
    Replaying,
    Complete,
    /// Failed or cancelled.
    Failed,
}

/// Handle for monitoring and controlling a background rebuild.
#[derive(Debug, Clone)]
pub struct RebuildHandle {
    progress: Arc<RwLock<ReplayProgress>>,
    cancellation: Arc<AtomicBool>,
}

impl RebuildHandle {
    pub async fn progress(&self) -> ReplayProgress {
        self.progress.read().await.clone()
    }

    /// Request cancellation. Honoured while events are loading, in which case
    /// the projection is left untouched. Once loading is done the swap runs
    /// to completion.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    pub async fn wait_for_completion(&self) -> Result<ReplayProgress, ReplayError> {
        loop {
            let progress = self.progress.read().await.clone();
            if progress.is_complete {
                return match progress.phase {
                    ReplayPhase::Complete => Ok(progress),
                    _ if self.is_cancelled() => Err(ReplayError::Cancelled),
                    _ => Err(ReplayError::Failed(
                        progress.error.unwrap_or_else(|| "unknown error".to_string()),
                    )),
                };
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
    }
}

/// Rebuild `projection` from `store` on a background task.
pub fn spawn_rebuild<S, P>(store: Arc<S>, projection: Arc<P>) -> RebuildHandle
where
    S: EventStore + ?Sized + 'static,
    P: Projection + ?Sized + 'static,
{
    let handle = RebuildHandle {
        progress: Arc::new(RwLock::new(ReplayProgress::started())),
        cancellation: Arc::new(AtomicBool::new(false)),
    };

    let task_handle = handle.clone();
    tokio::spawn(async move {
        let result = run_rebuild(&*store, &*projection, &task_handle).await;

        let mut prog = task_handle.progress.write().await;
        prog.is_complete = true;
        match result {
            Ok(()) => {
                prog.phase = ReplayPhase::Complete;
                info!(
                    aggregates = prog.processed_aggregates,
                    events = prog.processed_events,
                    "projection rebuild complete"
                );
            }
            Err(e) => {
                prog.phase = ReplayPhase::Failed;
                prog.error = Some(e.to_string());
                warn!(error = %e, "projection rebuild did not complete");
            }
        }
    });

    handle
}

async fn run_rebuild<S, P>(store: &S, projection: &P, handle: &RebuildHandle) -> Result<(), ReplayError>
where
    S: EventStore + ?Sized,
    P: Projection + ?Sized,
{
    let since = projection.watermark();
    let streams = load_all(store, Some(&*handle.cancellation)).await?;
    let summary = summarize(&streams);
    {
        let mut prog = handle.progress.write().await;
        prog.total_aggregates = summary.aggregates;
        prog.total_events = summary.events;
        prog.phase = ReplayPhase::Replaying;
    }

    // Last cancellation point.
    if handle.is_cancelled() {
        return Err(ReplayError::Cancelled);
    }
    projection.replace_all(flatten(streams), since);

    let mut prog = handle.progress.write().await;
    prog.processed_aggregates = summary.aggregates;
    prog.processed_events = summary.events;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use proptest::prelude::*;

    use tidemark_core::{AggregateStatus, Transition};

    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::aggregate_state::{AggregateProjection, DispatchTable};

    fn projection() -> AggregateProjection {
        let table = DispatchTable::new()
            .with("EventType1", Transition::Activate)
            .with("EventType2", Transition::Update)
            .with("Closed", Transition::Close);
        AggregateProjection::new(table, 4)
    }

    fn ev(id: &str, aggregate: &str, event_type: &str, data: &str, ts: i64) -> Event {
        Event::new(aggregate, event_type, data).with_id(id).at(ts)
    }

    async fn seeded_store() -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        for e in [
            ev("e2", "a1", "EventType2", "y", 2),
            ev("e1", "a1", "EventType1", "x", 1),
            ev("f1", "a2", "EventType1", "p", 1),
            ev("f2", "a2", "Closed", "", 5),
            ev("g1", "a3", "EventType1", "q", 3),
        ] {
            store.save_event(&e).await.unwrap();
        }
        store
    }

    /// Fails reads for aggregates whose id starts with `broken`.
    struct FlakyStore(InMemoryEventStore);

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn save_event(&self, event: &Event) -> Result<(), EventStoreError> {
            self.0.save_event(event).await
        }

        async fn get_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
            if aggregate_id.starts_with("broken") {
                return Err(EventStoreError::unavailable("get_events", aggregate_id, "disk on fire"));
            }
            self.0.get_events(aggregate_id).await
        }

        async fn get_event(&self, id: &str) -> Result<Option<Event>, EventStoreError> {
            self.0.get_event(id).await
        }

        async fn aggregate_ids(&self) -> Result<Vec<String>, EventStoreError> {
            self.0.aggregate_ids().await
        }
    }

    /// Saves and applies `live` the first time `trigger` is read, the way
    /// the ingest worker does when traffic arrives mid-replay.
    struct LiveTrafficStore {
        inner: InMemoryEventStore,
        projection: Arc<AggregateProjection>,
        trigger: &'static str,
        live: Mutex<Option<Event>>,
    }

    impl LiveTrafficStore {
        fn new(inner: InMemoryEventStore, projection: Arc<AggregateProjection>, trigger: &'static str, live: Event) -> Self {
            Self {
                inner,
                projection,
                trigger,
                live: Mutex::new(Some(live)),
            }
        }
    }

    #[async_trait]
    impl EventStore for LiveTrafficStore {
        async fn save_event(&self, event: &Event) -> Result<(), EventStoreError> {
            self.inner.save_event(event).await
        }

        async fn get_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
            let events = self.inner.get_events(aggregate_id).await?;
            let live = if aggregate_id == self.trigger {
                self.live.lock().unwrap().take()
            } else {
                None
            };
            if let Some(live) = live {
                self.inner.save_event(&live).await?;
                self.projection.handle_event(&live);
            }
            Ok(events)
        }

        async fn get_event(&self, id: &str) -> Result<Option<Event>, EventStoreError> {
            self.inner.get_event(id).await
        }

        async fn aggregate_ids(&self) -> Result<Vec<String>, EventStoreError> {
            self.inner.aggregate_ids().await
        }
    }

    /// Cancels the attached rebuild on the `cancel_at`-th aggregate read.
    struct CancellingStore {
        inner: InMemoryEventStore,
        cancel_at: usize,
        reads: AtomicUsize,
        handle: Mutex<Option<RebuildHandle>>,
    }

    #[async_trait]
    impl EventStore for CancellingStore {
        async fn save_event(&self, event: &Event) -> Result<(), EventStoreError> {
            self.inner.save_event(event).await
        }

        async fn get_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
            if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_at {
                if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                    handle.cancel();
                }
            }
            self.inner.get_events(aggregate_id).await
        }

        async fn get_event(&self, id: &str) -> Result<Option<Event>, EventStoreError> {
            self.inner.get_event(id).await
        }

        async fn aggregate_ids(&self) -> Result<Vec<String>, EventStoreError> {
            self.inner.aggregate_ids().await
        }
    }

    #[tokio::test]
    async fn replaying_one_aggregate_rebuilds_its_state() {
        let store = seeded_store().await;
        let p = projection();

        assert_eq!(replay_events(&store, &p, "a1").await.unwrap(), 2);

        let view = p.get("a1").unwrap();
        assert_eq!(view.status, AggregateStatus::Active);
        assert_eq!(view.data.as_deref(), Some("y"));
        assert!(p.get("a2").is_none());
    }

    #[tokio::test]
    async fn replaying_twice_changes_nothing() {
        let store = seeded_store().await;
        let p = projection();
        replay_events(&store, &p, "a1").await.unwrap();
        let once = p.get_state();
        replay_events(&store, &p, "a1").await.unwrap();
        assert_eq!(p.get_state(), once);
    }

    #[tokio::test]
    async fn unknown_aggregate_replays_nothing() {
        let store = seeded_store().await;
        let p = projection();
        assert_eq!(replay_events(&store, &p, "nope").await.unwrap(), 0);
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn store_failure_applies_nothing() {
        let store = FlakyStore(InMemoryEventStore::new());
        store.save_event(&ev("b1", "broken-1", "EventType1", "x", 1)).await.unwrap();
        let p = projection();

        let err = replay_events(&store, &p, "broken-1").await.unwrap_err();
        assert!(matches!(err, ReplayError::EventStore(EventStoreError::Unavailable { .. })));
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn replay_all_discards_stale_state() {
        let store = seeded_store().await;
        let p = projection();
        p.handle_event(&ev("ghost", "a9", "EventType1", "junk", 1));

        let summary = replay_all(&store, &p).await.unwrap();
        assert_eq!(summary, ReplaySummary { aggregates: 3, events: 5 });

        let state = p.get_state();
        assert_eq!(state.len(), 3);
        assert!(!state.contains_key("a9"));
        assert_eq!(state["a2"].status, AggregateStatus::Closed);
    }

    #[tokio::test]
    async fn failed_full_replay_keeps_existing_state() {
        let store = FlakyStore(InMemoryEventStore::new());
        store.save_event(&ev("e1", "a1", "EventType1", "x", 1)).await.unwrap();
        store.save_event(&ev("b1", "broken-1", "EventType1", "x", 1)).await.unwrap();

        let p = projection();
        p.handle_event(&ev("keep", "a5", "EventType1", "kept", 1));

        assert!(replay_all(&store, &p).await.is_err());
        assert_eq!(p.get("a5").unwrap().data.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn replaying_one_aggregate_replaces_its_existing_state() {
        let store = seeded_store().await;
        let p = projection();
        // Applied without being stored, and out of order with the history.
        p.handle_event(&ev("ghost", "a1", "Closed", "", 9));
        p.handle_event(&ev("e2", "a1", "EventType2", "y", 2));

        replay_events(&store, &p, "a1").await.unwrap();

        let fresh = projection();
        replay_events(&store, &fresh, "a1").await.unwrap();
        assert_eq!(p.get("a1"), fresh.get("a1"));
        assert_eq!(p.get("a1").unwrap().history, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn events_ingested_during_a_full_replay_are_kept() {
        let p = Arc::new(projection());
        let live = ev("live", "a1", "EventType2", "z", 10);
        let store = LiveTrafficStore::new(seeded_store().await, p.clone(), "a1", live);

        replay_all(&store, &*p).await.unwrap();

        let view = p.get("a1").unwrap();
        assert_eq!(view.history, vec!["e1", "e2", "live"]);
        assert_eq!(view.data.as_deref(), Some("z"));
        assert_eq!(p.len(), 3);

        // The next rebuild reads it back from the store.
        replay_all(&store, &*p).await.unwrap();
        assert_eq!(p.get("a1").unwrap().history, vec!["e1", "e2", "live"]);
    }

    #[tokio::test]
    async fn events_ingested_during_an_aggregate_replay_are_kept() {
        let p = Arc::new(projection());
        let live = ev("live", "a1", "EventType2", "z", 10);
        let store = LiveTrafficStore::new(seeded_store().await, p.clone(), "a1", live);

        assert_eq!(replay_events(&store, &*p, "a1").await.unwrap(), 2);

        assert_eq!(p.get("a1").unwrap().history, vec!["e1", "e2", "live"]);
    }

    #[tokio::test]
    async fn events_ingested_during_a_background_rebuild_are_kept() {
        let p = Arc::new(projection());
        let live = ev("live", "a2", "EventType2", "z", 10);
        let store = Arc::new(LiveTrafficStore::new(seeded_store().await, p.clone(), "a2", live));

        let progress = spawn_rebuild(store, p.clone()).wait_for_completion().await.unwrap();

        assert_eq!(progress.processed_events, 5);
        // a2 was closed before the live update arrived.
        let view = p.get("a2").unwrap();
        assert_eq!(view.history, vec!["f1", "f2", "live"]);
        assert_eq!(view.status, AggregateStatus::Closed);
        assert_eq!(view.rejected_transitions, 1);
    }

    #[tokio::test]
    async fn background_rebuild_reports_progress() {
        let store = Arc::new(seeded_store().await);
        let p = Arc::new(projection());
        p.handle_event(&ev("ghost", "a9", "EventType1", "junk", 1));

        let handle = spawn_rebuild(store, p.clone());
        let progress = handle.wait_for_completion().await.unwrap();

        assert_eq!(progress.phase, ReplayPhase::Complete);
        assert_eq!(progress.total_aggregates, 3);
        assert_eq!(progress.processed_events, 5);
        assert!(p.get("a9").is_none());
        assert_eq!(p.len(), 3);
    }

    #[tokio::test]
    async fn cancelled_rebuild_before_start_leaves_projection_alone() {
        let store = Arc::new(seeded_store().await);
        let p = Arc::new(projection());
        p.handle_event(&ev("keep", "a5", "EventType1", "kept", 1));

        // The current-thread runtime does not run the task until we yield.
        let handle = spawn_rebuild(store, p.clone());
        handle.cancel();

        assert!(matches!(handle.wait_for_completion().await, Err(ReplayError::Cancelled)));
        assert_eq!(handle.progress().await.phase, ReplayPhase::Failed);
        assert!(p.get("a5").is_some());
    }

    #[tokio::test]
    async fn cancelling_while_loading_never_leaves_partial_state() {
        for cancel_at in 1..=3 {
            let store = Arc::new(CancellingStore {
                inner: seeded_store().await,
                cancel_at,
                reads: AtomicUsize::new(0),
                handle: Mutex::new(None),
            });
            let p = Arc::new(projection());
            p.handle_event(&ev("keep", "a5", "EventType1", "kept", 1));
            let before = p.get_state();

            let handle = spawn_rebuild(store.clone(), p.clone());
            *store.handle.lock().unwrap() = Some(handle.clone());

            assert!(
                matches!(handle.wait_for_completion().await, Err(ReplayError::Cancelled)),
                "cancel_at {cancel_at}"
            );
            assert_eq!(p.get_state(), before, "cancel_at {cancel_at}");
        }
    }

    #[tokio::test]
    async fn cancelling_a_finished_rebuild_changes_nothing() {
        let store = Arc::new(seeded_store().await);
        let p = Arc::new(projection());

        let handle = spawn_rebuild(store, p.clone());
        handle.wait_for_completion().await.unwrap();
        handle.cancel();

        assert_eq!(handle.progress().await.phase, ReplayPhase::Complete);
        assert_eq!(p.len(), 3);
    }

    #[tokio::test]
    async fn background_rebuild_surfaces_store_errors() {
        let inner = InMemoryEventStore::new();
        inner.save_event(&ev("b1", "broken-1", "EventType1", "x", 1)).await.unwrap();
        let handle = spawn_rebuild(Arc::new(FlakyStore(inner)), Arc::new(projection()));

        match handle.wait_for_completion().await {
            Err(ReplayError::Failed(reason)) => assert!(reason.contains("disk on fire")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn adjacent_windows_converge_to_full_replay(
            kinds in prop::collection::vec(0usize..4, 1..40),
            cuts in prop::collection::btree_set(0i64..40, 0..5),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                for (i, kind) in kinds.iter().enumerate() {
                    let event_type = ["EventType1", "EventType2", "Closed", "Other"][*kind];
                    store
                        .save_event(&ev(&format!("e{i}"), "a1", event_type, &i.to_string(), i as i64))
                        .await
                        .unwrap();
                }

                let full = projection();
                replay_events(&store, &full, "a1").await.unwrap();

                let windowed = projection();
                let mut bounds: Vec<Option<i64>> = vec![None];
                bounds.extend(cuts.iter().copied().map(Some));
                bounds.push(None);
                for pair in bounds.windows(2) {
                    let range = TimeRange { from: pair[0], to: pair[1] };
                    replay_window(&store, &windowed, "a1", range).await.unwrap();
                }

                assert_eq!(windowed.get_state(), full.get_state());
            });
        }
    }
}
