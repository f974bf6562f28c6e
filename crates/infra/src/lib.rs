//! Infrastructure layer: configuration, event store backends, broker-backed
//! event buses, projections and background workers.

pub mod config;
pub mod event_bus;
pub mod event_store;
pub mod projections;
pub mod workers;
