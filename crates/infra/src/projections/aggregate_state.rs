use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;
use tracing::{debug, warn};

use tidemark_core::{AggregateStatus, Event, Transition};
use tidemark_events::delivery::partition_for;
use tidemark_events::Projection;

use crate::config::{ProjectionSettings, TransitionRule};

/// Maps event types to lifecycle transitions. Types not in the table are
/// ignored by the projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchTable {
    rules: HashMap<String, Transition>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, event_type: impl Into<String>, transition: Transition) -> Self {
        self.rules.insert(event_type.into(), transition);
        self
    }

    pub fn from_rules(rules: &[TransitionRule]) -> Self {
        rules.iter().fold(Self::new(), |table, rule| {
            table.with(rule.event_type.clone(), rule.transition)
        })
    }

    pub fn lookup(&self, event_type: &str) -> Option<Transition> {
        self.rules.get(event_type).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Queryable read model for one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateView {
    pub aggregate_id: String,
    pub status: AggregateStatus,
    /// Payload of the last `Activate`/`Update` event.
    pub data: Option<String>,
    /// Number of recognised events applied (including rejected transitions).
    pub version: u64,
    pub last_event_id: Option<String>,
    pub last_timestamp: Option<i64>,
    /// Applied event ids in timestamp order.
    pub history: Vec<String>,
    /// Recognised events whose transition was not allowed from the status
    /// they arrived in.
    pub rejected_transitions: u64,
}

impl AggregateView {
    fn new(aggregate_id: &str) -> Self {
        Self {
            aggregate_id: aggregate_id.to_string(),
            status: AggregateStatus::Initial,
            data: None,
            version: 0,
            last_event_id: None,
            last_timestamp: None,
            history: Vec::new(),
            rejected_transitions: 0,
        }
    }

    fn step(&mut self, transition: Transition, event: &Event) -> ApplyOutcome {
        let outcome = match self.status.apply(transition) {
            Ok(next) => {
                self.status = next;
                if transition.carries_data() {
                    self.data = Some(event.data.clone());
                }
                ApplyOutcome::Applied
            }
            Err(err) => {
                debug!(aggregate_id = %event.aggregate_id, event_id = %event.id, error = %err, "transition rejected");
                self.rejected_transitions += 1;
                ApplyOutcome::Rejected
            }
        };

        self.version += 1;
        self.last_timestamp = Some(event.timestamp);
        self.last_event_id = Some(event.id.clone());
        self.history.push(event.id.clone());
        outcome
    }
}

/// What happened to one event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Recognised type, transition not allowed: recorded, status unchanged.
    Rejected,
    /// Type not in the dispatch table.
    Ignored,
    /// Event id already applied to this aggregate.
    Duplicate,
    /// Older than an event already applied: inserted in timestamp order and
    /// the aggregate re-folded.
    Reordered,
}

#[derive(Debug, Clone)]
struct Applied {
    event: Event,
    seq: u64,
}

impl Applied {
    fn key(&self) -> (i64, u64) {
        (self.event.timestamp, self.seq)
    }
}

/// One aggregate: its view plus every recognised event folded into it,
/// ordered by `(timestamp, seq)`. The retained events are what a late event
/// is re-folded against and what a replay swap keeps from live traffic, so
/// memory grows with the aggregate's history.
#[derive(Debug, Clone)]
struct Entry {
    view: AggregateView,
    events: Vec<Applied>,
    seen: HashSet<String>,
}

impl Entry {
    fn new(aggregate_id: &str) -> Self {
        Self {
            view: AggregateView::new(aggregate_id),
            events: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn insert(&mut self, dispatch: &DispatchTable, transition: Transition, event: &Event, seq: u64) -> ApplyOutcome {
        if self.seen.contains(&event.id) {
            debug!(aggregate_id = %event.aggregate_id, event_id = %event.id, "skipping already applied event");
            return ApplyOutcome::Duplicate;
        }
        self.seen.insert(event.id.clone());

        let applied = Applied { event: event.clone(), seq };
        let in_order = self.events.last().is_none_or(|last| last.key() <= applied.key());
        if in_order {
            self.events.push(applied);
            return self.view.step(transition, event);
        }

        let at = self.events.partition_point(|a| a.key() <= applied.key());
        self.events.insert(at, applied);
        self.refold(dispatch);
        warn!(
            aggregate_id = %event.aggregate_id,
            event_id = %event.id,
            timestamp = event.timestamp,
            "event arrived out of order, aggregate re-folded"
        );
        ApplyOutcome::Reordered
    }

    fn refold(&mut self, dispatch: &DispatchTable) {
        let mut view = AggregateView::new(&self.view.aggregate_id);
        for applied in &self.events {
            if let Some(transition) = dispatch.lookup(&applied.event.event_type) {
                view.step(transition, &applied.event);
            }
        }
        self.view = view;
    }
}

/// Per-aggregate lifecycle projection.
///
/// - One `RwLock` guards the whole state map; every mutation holds the
///   write lock, so concurrent `handle_event` calls never lose updates.
/// - Every applied event gets a sequence number. An aggregate's view is
///   always the fold of its events ordered by `(timestamp, seq)`; a late
///   event is inserted in place and the aggregate re-folded.
/// - `handle_events` hashes aggregate ids onto `workers` lanes and applies
///   the lanes in parallel. All events of one aggregate share a lane.
/// - `replace_aggregate` and `replace_all` build the new state off to the
///   side, then swap it in under the write lock together with any event
///   applied live at or after the caller's watermark.
/// - Idempotent: event ids already applied to an aggregate are skipped.
#[derive(Debug)]
pub struct AggregateProjection {
    dispatch: DispatchTable,
    workers: usize,
    next_seq: AtomicU64,
    state: RwLock<HashMap<String, Entry>>,
}

impl AggregateProjection {
    pub fn new(dispatch: DispatchTable, workers: usize) -> Self {
        Self {
            dispatch,
            workers: workers.max(1),
            next_seq: AtomicU64::new(0),
            state: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &ProjectionSettings) -> Self {
        Self::new(DispatchTable::from_rules(&settings.transitions), settings.workers)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    /// Apply one event and report what happened.
    pub fn apply(&self, event: &Event) -> ApplyOutcome {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        // Taken under the lock: a watermark read never passes an event that
        // has not reached the map yet.
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        apply_to(&self.dispatch, &mut state, event, seq)
    }

    pub fn get(&self, aggregate_id: &str) -> Option<AggregateView> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        state.get(aggregate_id).map(|e| e.view.clone())
    }

    /// Number of aggregates with state.
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold `events` into `state`, one lane per worker.
    fn apply_lanes(&self, state: &mut HashMap<String, Entry>, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }

        let base = self.next_seq.fetch_add(events.len() as u64, Ordering::SeqCst);
        let mut lanes: Vec<Vec<Applied>> = vec![Vec::new(); self.workers];
        for (offset, event) in events.into_iter().enumerate() {
            let lane = partition_for(&event.aggregate_id, self.workers);
            lanes[lane].push(Applied {
                event,
                seq: base + offset as u64,
            });
        }
        for lane in &mut lanes {
            lane.sort_by_key(Applied::key);
        }
        lanes.retain(|lane| !lane.is_empty());

        if lanes.len() == 1 {
            for applied in &lanes[0] {
                apply_to(&self.dispatch, state, &applied.event, applied.seq);
            }
            return;
        }

        // Each lane owns the entries of its aggregates while it runs.
        let mut owned: Vec<HashMap<String, Entry>> = lanes
            .iter()
            .map(|lane| {
                lane.iter()
                    .filter_map(|a| state.remove_entry(&a.event.aggregate_id))
                    .collect()
            })
            .collect();

        let dispatch = &self.dispatch;
        std::thread::scope(|scope| {
            for (lane, entries) in lanes.iter().zip(owned.iter_mut()) {
                scope.spawn(move || {
                    for applied in lane {
                        apply_to(dispatch, entries, &applied.event, applied.seq);
                    }
                });
            }
        });

        for entries in owned {
            state.extend(entries);
        }
    }

    /// Re-apply to `staged` the events of `old` applied at or after `since`.
    fn carry_live(&self, staged: &mut HashMap<String, Entry>, old: Entry, since: u64) {
        for applied in old.events.into_iter().filter(|a| a.seq >= since) {
            apply_to(&self.dispatch, staged, &applied.event, applied.seq);
        }
    }
}

fn apply_to(dispatch: &DispatchTable, state: &mut HashMap<String, Entry>, event: &Event, seq: u64) -> ApplyOutcome {
    let Some(transition) = dispatch.lookup(&event.event_type) else {
        return ApplyOutcome::Ignored;
    };

    state
        .entry(event.aggregate_id.clone())
        .or_insert_with(|| Entry::new(&event.aggregate_id))
        .insert(dispatch, transition, event, seq)
}

impl Projection for AggregateProjection {
    type State = HashMap<String, AggregateView>;

    fn handle_event(&self, event: &Event) {
        self.apply(event);
    }

    fn handle_events(&self, events: Vec<Event>) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        self.apply_lanes(&mut state, events);
    }

    fn get_state(&self) -> Self::State {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        state
            .iter()
            .map(|(id, entry)| (id.clone(), entry.view.clone()))
            .collect()
    }

    fn clear(&self) {
        self.state.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn clear_aggregate(&self, aggregate_id: &str) {
        self.state
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(aggregate_id);
    }

    fn watermark(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    fn replace_aggregate(&self, aggregate_id: &str, events: Vec<Event>, since: u64) {
        let events: Vec<Event> = events
            .into_iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .collect();
        let mut staged = HashMap::new();
        self.apply_lanes(&mut staged, events);

        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = state.remove(aggregate_id) {
            self.carry_live(&mut staged, old, since);
        }
        if let Some(entry) = staged.remove(aggregate_id) {
            state.insert(aggregate_id.to_string(), entry);
        }
    }

    fn replace_all(&self, events: Vec<Event>, since: u64) {
        let mut staged = HashMap::new();
        self.apply_lanes(&mut staged, events);

        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        for (_, old) in state.drain() {
            self.carry_live(&mut staged, old, since);
        }
        *state = staged;
    }
}
