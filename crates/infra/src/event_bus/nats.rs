//! NATS core event bus.
//!
//! Topics map 1:1 onto subjects. `publish` sends the event data as payload
//! and the remaining fields as message headers; a publish is acknowledged
//! once the client has flushed it to the server. Each subscription is one
//! subject with one sequential delivery loop, optionally in a queue group so
//! several processes share the work.

use std::sync::Arc;

use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use tidemark_core::Event;
use tidemark_events::delivery::{deliver, shutdown_requested, DeliveryTasks};
use tidemark_events::envelope::outbound_headers;
use tidemark_events::{headers, BusError, EventBus, EventHandler, InboundMessage};

use crate::config::NatsSettings;

const BACKEND: &str = "nats";

fn inbound_message(msg: &async_nats::Message) -> InboundMessage {
    let mut inbound = InboundMessage::new(msg.payload.to_vec());
    if let Some(map) = &msg.headers {
        for name in [
            headers::EVENT_ID,
            headers::AGGREGATE_ID,
            headers::EVENT_TYPE,
            headers::TIMESTAMP,
        ] {
            if let Some(value) = map.get(name) {
                inbound = inbound.with_header(name, value.as_str());
            }
        }
    }
    inbound
}

/// NATS-backed [`EventBus`].
pub struct NatsEventBus {
    settings: NatsSettings,
    client: Client,
    tasks: DeliveryTasks,
}

impl NatsEventBus {
    pub async fn connect(settings: NatsSettings) -> Result<Self, BusError> {
        settings
            .validate()
            .map_err(|e| BusError::config(e.to_string()))?;

        let client = ConnectOptions::new()
            .connection_timeout(settings.publish_timeout)
            .connect(settings.url.as_str())
            .await
            .map_err(|e| BusError::connection(BACKEND, e))?;

        info!(url = %settings.url, queue_group = ?settings.queue_group, "connected to nats");
        Ok(Self {
            settings,
            client,
            tasks: DeliveryTasks::new(BACKEND),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Publish and wait for the flush, bounded by the publish timeout.
    async fn send(&self, topic: &str, headers: Option<HeaderMap>, payload: Vec<u8>) -> Result<(), BusError> {
        self.tasks.ensure_open()?;

        let timeout = self.settings.publish_timeout;
        let subject = topic.to_string();
        let attempt = async {
            match headers {
                Some(headers) => self
                    .client
                    .publish_with_headers(subject, headers, payload.into())
                    .await
                    .map_err(|e| BusError::publish(topic, e))?,
                None => self
                    .client
                    .publish(subject, payload.into())
                    .await
                    .map_err(|e| BusError::publish(topic, e))?,
            }
            self.client
                .flush()
                .await
                .map_err(|e| BusError::publish(topic, e))
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| BusError::timeout(topic, timeout))?
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn publish_event(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        self.send(topic, None, payload.to_vec()).await?;
        debug!(topic, bytes = payload.len(), "published raw payload to nats");
        Ok(())
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<(), BusError> {
        let mut map = HeaderMap::new();
        for (name, value) in outbound_headers(event) {
            map.insert(name, value.as_str());
        }
        self.send(topic, Some(map), event.data.as_bytes().to_vec()).await?;
        debug!(topic, event_id = %event.id, "published event to nats");
        Ok(())
    }

    async fn consumer_event(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        self.tasks.ensure_open()?;

        let subject = topic.to_string();
        let mut subscriber = match &self.settings.queue_group {
            Some(group) => self.client.queue_subscribe(subject, group.clone()).await,
            None => self.client.subscribe(subject).await,
        }
        .map_err(|e| BusError::subscribe(topic, e))?;

        // Make sure the server has registered interest before returning.
        self.client
            .flush()
            .await
            .map_err(|e| BusError::subscribe(topic, e))?;

        let topic_name = topic.to_string();
        let mut signal = self.tasks.signal();
        self.tasks.spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut signal) => break,
                    next = subscriber.next() => next,
                };
                let Some(msg) = next else {
                    warn!(topic = %topic_name, "nats subscription closed by the server");
                    break;
                };
                deliver(handler.as_ref(), &topic_name, 0, inbound_message(&msg).into_event()).await;
            }

            if let Err(err) = subscriber.unsubscribe().await {
                debug!(topic = %topic_name, error = %err, "nats unsubscribe failed");
            }
        });

        info!(topic, queue_group = ?self.settings.queue_group, "nats subscription started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        self.tasks.close().await;
        if let Err(err) = self.client.flush().await {
            warn!(error = %err, "nats flush incomplete at shutdown");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let mut settings = NatsSettings::new("nats://127.0.0.1:1");
        settings.publish_timeout = Duration::from_millis(300);

        match NatsEventBus::connect(settings).await {
            Err(err) => assert!(matches!(err, BusError::Connection { backend: "nats", .. })),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn empty_url_is_rejected_before_connecting() {
        let result = NatsEventBus::connect(NatsSettings::new("  ")).await;
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[tokio::test]
    #[ignore = "requires NATS_URL"]
    async fn events_round_trip_with_metadata() {
        let url = std::env::var("NATS_URL").expect("NATS_URL must point at a NATS server");
        let bus = NatsEventBus::connect(NatsSettings::new(url)).await.unwrap();

        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let topic = format!("tidemark-test-{}", tidemark_core::new_event_id());
        bus.consumer_event(
            &topic,
            tidemark_events::handler_fn(move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let event = Event::new("a1", "EventType1", "x").with_id("e1").at(42);
        bus.publish(&topic, &event).await.unwrap();

        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.lock().unwrap().as_slice(), &[event]);
        bus.shutdown().await.unwrap();
    }
}
