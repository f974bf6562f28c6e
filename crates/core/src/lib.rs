//! `tidemark-core`: the event record and the aggregate lifecycle.
//!
//! This crate contains **pure** primitives (no IO, no async). Transport,
//! storage and projection mechanics live in `tidemark-events` and
//! `tidemark-infra`.

pub mod aggregate;
pub mod error;
pub mod event;
pub mod id;

pub use aggregate::{AggregateStatus, Transition};
pub use error::{DomainError, DomainResult};
pub use event::{Event, TimeRange, UNSET_TIMESTAMP};
pub use id::{new_event_id, now_millis};
