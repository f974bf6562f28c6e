//! Projection implementations (read model builders) and replay tooling.
//!
//! Projections are:
//! - **Rebuildable**: reconstructed from the event store by [`replay`]
//! - **Idempotent**: safe for at-least-once delivery

pub mod aggregate_state;
pub mod replay;

pub use aggregate_state::{AggregateProjection, AggregateView, ApplyOutcome, DispatchTable};
pub use replay::{
    replay_all, replay_events, replay_window, spawn_rebuild, RebuildHandle, ReplayError,
    ReplayPhase, ReplayProgress, ReplaySummary,
};
