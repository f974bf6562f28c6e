//! Long-running background workers.

pub mod ingest;

pub use ingest::{start_ingest, ApplyEventFn, IngestHandler};
