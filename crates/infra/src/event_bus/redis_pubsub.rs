//! Redis pub/sub-backed event bus.
//!
//! Note: Redis pub/sub is not durable (messages are dropped while no
//! subscriber is connected). The event store stays the source of truth; use
//! replay to catch a projection up after downtime.
//!
//! Channels carry no metadata, so `publish` sends a JSON envelope holding the
//! whole event. Payloads that are not an envelope (`publish_event`, foreign
//! publishers) are delivered as raw `data`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tidemark_core::Event;
use tidemark_events::delivery::{deliver, shutdown_requested, DeliveryTasks};
use tidemark_events::{BusError, EventBus, EventHandler, InboundMessage};

use crate::config::RedisSettings;

const BACKEND: &str = "redis";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    tidemark_event: Event,
}

fn encode(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&Envelope {
        tidemark_event: event.clone(),
    })
}

fn decode(payload: Vec<u8>) -> Event {
    match serde_json::from_slice::<Envelope>(&payload) {
        Ok(envelope) => envelope.tidemark_event,
        Err(_) => InboundMessage::new(payload).into_event(),
    }
}

/// Redis pub/sub bus.
pub struct RedisPubSubEventBus {
    settings: RedisSettings,
    client: redis::Client,
    publisher: MultiplexedConnection,
    tasks: DeliveryTasks,
}

impl RedisPubSubEventBus {
    pub async fn connect(settings: RedisSettings) -> Result<Self, BusError> {
        settings
            .validate()
            .map_err(|e| BusError::config(e.to_string()))?;

        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| BusError::config(format!("invalid redis url: {e}")))?;

        let publisher = tokio::time::timeout(
            settings.publish_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| BusError::connection(BACKEND, "timed out connecting"))?
        .map_err(|e| BusError::connection(BACKEND, e))?;

        info!(url = %settings.url, "connected to redis");
        Ok(Self {
            settings,
            client,
            publisher,
            tasks: DeliveryTasks::new(BACKEND),
        })
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.tasks.ensure_open()?;

        let timeout = self.settings.publish_timeout;
        let mut conn = self.publisher.clone();
        let receivers: i64 = tokio::time::timeout(timeout, conn.publish(topic, payload))
            .await
            .map_err(|_| BusError::timeout(topic, timeout))?
            .map_err(|e| BusError::publish(topic, e))?;

        debug!(topic, receivers, "published to redis channel");
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisPubSubEventBus {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn publish_event(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        self.send(topic, payload.to_vec()).await
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<(), BusError> {
        let payload = encode(event).map_err(|e| BusError::publish(topic, e))?;
        self.send(topic, payload).await
    }

    async fn consumer_event(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        self.tasks.ensure_open()?;

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::subscribe(topic, e))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BusError::subscribe(topic, e))?;

        let topic_name = topic.to_string();
        let mut signal = self.tasks.signal();
        self.tasks.spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut signal) => break,
                    next = messages.next() => next,
                };
                let Some(msg) = next else {
                    warn!(topic = %topic_name, "redis subscription connection closed");
                    break;
                };
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(topic = %topic_name, error = %err, "unreadable redis payload");
                        continue;
                    }
                };
                deliver(handler.as_ref(), &topic_name, 0, decode(payload)).await;
            }
        });

        info!(topic, "redis subscription started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        self.tasks.close().await;
        Ok(())
    }
}
