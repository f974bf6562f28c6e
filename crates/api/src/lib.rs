//! HTTP API: event ingress, projection queries and replay control.

pub mod app;
