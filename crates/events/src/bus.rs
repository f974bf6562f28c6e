//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern**: a pub/sub mechanism for
//! distributing events to consumers (the ingest worker, projections, other
//! services) over an interchangeable transport.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: an event may be delivered more than once; consumers
//!   must be idempotent (the store rejects duplicate ids, the projection skips
//!   them).
//! - **Per-partition ordering**: each partition (Kafka partition, NATS
//!   subject, in-process lane) is consumed by exactly one sequential loop.
//! - **No cross-partition or cross-topic ordering.**
//! - **No persistence**: the bus distributes, the event store is the source
//!   of truth.
//!
//! ## Topics
//!
//! A topic is a logical channel name. Adapters map it 1:1 onto their native
//! addressing unit (a Kafka topic with its partitions, a NATS subject, a
//! Redis channel, an in-process topic).

use std::sync::Arc;

use async_trait::async_trait;

use tidemark_core::Event;

use crate::error::BusError;
use crate::handler::EventHandler;

/// Transport-agnostic event bus.
///
/// ## Publishing
///
/// Both publish methods await the backend's acknowledgement (or its error).
/// A publish never fails silently: a rejected or unacknowledged message is
/// reported as [`BusError::Publish`] or [`BusError::Timeout`]. Retries are a
/// property of the adapter configuration (e.g. the Kafka producer's bounded
/// retries), not of callers.
///
/// ## Consuming
///
/// [`EventBus::consumer_event`] registers a handler and returns once the
/// subscription is established. Registration problems (unknown topic,
/// unreachable broker) are returned from the call; anything that goes wrong
/// afterwards (handler errors, undecodable messages, broker hiccups) is
/// logged and stays isolated to the affected partition.
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`; one bus is shared by all publishers and
/// subscribers of a process.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Short backend name used in logs (`"memory"`, `"kafka"`, ...).
    fn backend(&self) -> &'static str;

    /// Publish a raw payload. Consumers see it as an event whose `data` is
    /// the payload and whose other fields are empty.
    async fn publish_event(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Publish an event: `data` is the payload, the remaining fields travel as
    /// transport metadata and the aggregate id is the partitioning key.
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), BusError>;

    /// Register `handler` for every message on `topic`.
    async fn consumer_event(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError>;

    /// Stop all delivery loops, wait for in-flight handler calls and release
    /// connections. Subsequent calls to `consumer_event` fail with
    /// [`BusError::Closed`].
    async fn shutdown(&self) -> Result<(), BusError>;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    async fn publish_event(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        (**self).publish_event(topic, payload).await
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<(), BusError> {
        (**self).publish(topic, event).await
    }

    async fn consumer_event(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        (**self).consumer_event(topic, handler).await
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        (**self).shutdown().await
    }
}
