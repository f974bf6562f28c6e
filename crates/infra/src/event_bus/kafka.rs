//! Kafka event bus.
//!
//! - Publishing uses an idempotent `FutureProducer` (`acks=all`, bounded
//!   retries). `publish` keys records by aggregate id, so one aggregate's
//!   events stay on one partition; the remaining event fields travel as
//!   record headers.
//! - `consumer_event` creates a dedicated consumer per subscription, assigns
//!   every partition of the topic and splits each partition into its own
//!   queue with its own delivery loop. Partitions are consumed concurrently,
//!   each in offset order.
//! - Without a consumer group, subscriptions start at the newest (or oldest)
//!   offset, nothing is committed and a failed handler invocation is logged
//!   and skipped. With a group, subscriptions resume from the group's
//!   committed offsets; a failed event is redelivered with backoff, holding
//!   back its partition, and its offset is committed only once handled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use tidemark_core::Event;
use tidemark_events::delivery::{deliver, deliver_until_handled, shutdown_requested, Backoff, DeliveryTasks};
use tidemark_events::envelope::outbound_headers;
use tidemark_events::{BusError, EventBus, EventHandler, InboundMessage};

use crate::config::{KafkaSettings, StartOffset};

const BACKEND: &str = "kafka";

/// Group id used when subscriptions are not bound to a consumer group.
const EPHEMERAL_GROUP: &str = "tidemark-ephemeral";

fn apply_security_config(settings: &KafkaSettings, config: &mut ClientConfig) {
    if let Some(ref protocol) = settings.security_protocol {
        config.set("security.protocol", protocol);
    }
    if let Some(ref mechanism) = settings.sasl_mechanism {
        config.set("sasl.mechanism", mechanism);
    }
    if let Some(ref username) = settings.sasl_username {
        config.set("sasl.username", username);
    }
    if let Some(ref password) = settings.sasl_password {
        config.set("sasl.password", password);
    }
}

pub(crate) fn producer_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", settings.bootstrap_servers());
    config.set("message.timeout.ms", settings.publish_timeout.as_millis().to_string());
    config.set("acks", "all");
    config.set("enable.idempotence", "true");
    config.set("retries", settings.retries.to_string());
    apply_security_config(settings, &mut config);
    config
}

pub(crate) fn consumer_config(settings: &KafkaSettings) -> ClientConfig {
    let reset = match settings.start_offset {
        StartOffset::Latest => "latest",
        StartOffset::Earliest => "earliest",
    };

    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", settings.bootstrap_servers());
    config.set("enable.auto.commit", "false");
    config.set("auto.offset.reset", reset);
    config.set(
        "group.id",
        settings.group_id.as_deref().unwrap_or(EPHEMERAL_GROUP),
    );
    apply_security_config(settings, &mut config);
    config
}

/// Offset a partition starts from when first assigned.
fn start_position(settings: &KafkaSettings) -> Offset {
    match (&settings.group_id, settings.start_offset) {
        (Some(_), _) => Offset::Stored,
        (None, StartOffset::Latest) => Offset::End,
        (None, StartOffset::Earliest) => Offset::Beginning,
    }
}

/// Offset to commit after processing the message at `offset`.
///
/// Only group-bound subscriptions commit, and only once the handler has
/// succeeded; anything else leaves the group positioned on the message.
fn commit_target(group_bound: bool, handled: bool, offset: i64) -> Option<i64> {
    (group_bound && handled).then_some(offset + 1)
}

fn publish_error(topic: &str, timeout: Duration, err: KafkaError) -> BusError {
    match err {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => {
            BusError::timeout(topic, timeout)
        }
        other => BusError::publish(topic, other),
    }
}

fn inbound_message(msg: &BorrowedMessage<'_>) -> InboundMessage {
    let mut inbound = InboundMessage::new(msg.payload().unwrap_or_default());
    if let Some(key) = msg.key() {
        inbound = inbound.with_key(String::from_utf8_lossy(key));
    }
    if let Some(headers) = msg.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                inbound = inbound.with_header(header.key, String::from_utf8_lossy(value));
            }
        }
    }
    if let Some(ts) = msg.timestamp().to_millis() {
        inbound = inbound.with_broker_timestamp(ts);
    }
    inbound
}

/// Kafka-backed [`EventBus`].
pub struct KafkaEventBus {
    settings: KafkaSettings,
    producer: FutureProducer,
    tasks: DeliveryTasks,
}

impl KafkaEventBus {
    /// Create the producer. Brokers are contacted lazily, so an unreachable
    /// cluster surfaces on the first publish or subscription.
    pub fn connect(settings: KafkaSettings) -> Result<Self, BusError> {
        settings
            .validate()
            .map_err(|e| BusError::config(e.to_string()))?;

        let producer: FutureProducer = producer_config(&settings)
            .create()
            .map_err(|e| BusError::connection(BACKEND, format!("failed to create producer: {e}")))?;

        info!(
            bootstrap_servers = %settings.bootstrap_servers(),
            group_id = ?settings.group_id,
            "kafka producer ready"
        );

        Ok(Self {
            settings,
            producer,
            tasks: DeliveryTasks::new(BACKEND),
        })
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }

    async fn send(&self, topic: &str, record: FutureRecord<'_, str, [u8]>) -> Result<(), BusError> {
        self.tasks.ensure_open()?;
        let timeout = self.settings.publish_timeout;
        match self.producer.send(record, timeout).await {
            Ok(_) => Ok(()),
            Err((err, _)) => Err(publish_error(topic, timeout, err)),
        }
    }

    /// Partition ids of `topic`, failing when the topic is unknown.
    async fn partitions(&self, consumer: Arc<StreamConsumer>, topic: &str) -> Result<Vec<i32>, BusError> {
        let timeout = self.settings.publish_timeout;
        let name = topic.to_string();
        let metadata = tokio::task::spawn_blocking(move || consumer.fetch_metadata(Some(name.as_str()), timeout))
            .await
            .map_err(|e| BusError::subscribe(topic, e))?
            .map_err(|e| BusError::subscribe(topic, format!("metadata request failed: {e}")))?;

        let Some(entry) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Err(BusError::subscribe(topic, "topic not found"));
        };
        if let Some(err) = entry.error() {
            return Err(BusError::subscribe(topic, format!("topic unavailable: {err:?}")));
        }
        let ids: Vec<i32> = entry.partitions().iter().map(|p| p.id()).collect();
        if ids.is_empty() {
            return Err(BusError::subscribe(topic, "topic has no partitions"));
        }
        Ok(ids)
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn publish_event(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic).payload(payload);
        self.send(topic, record).await?;
        debug!(topic, bytes = payload.len(), "published raw payload to kafka");
        Ok(())
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<(), BusError> {
        let mut headers = OwnedHeaders::new_with_capacity(4);
        for (key, value) in outbound_headers(event) {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(event.aggregate_id.as_str())
            .payload(event.data.as_bytes())
            .headers(headers);
        self.send(topic, record).await?;

        debug!(topic, event_id = %event.id, aggregate_id = %event.aggregate_id, "published event to kafka");
        Ok(())
    }

    async fn consumer_event(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        self.tasks.ensure_open()?;

        let consumer: Arc<StreamConsumer> = Arc::new(
            consumer_config(&self.settings)
                .create()
                .map_err(|e| BusError::connection(BACKEND, format!("failed to create consumer: {e}")))?,
        );

        let partitions = self.partitions(consumer.clone(), topic).await?;

        // Queues are split before assignment so no message of an assigned
        // partition can reach the main queue.
        let mut queues = Vec::with_capacity(partitions.len());
        for &partition in &partitions {
            let queue = consumer.split_partition_queue(topic, partition).ok_or_else(|| {
                BusError::subscribe(topic, format!("cannot split queue for partition {partition}"))
            })?;
            queues.push((partition, queue));
        }

        let start = start_position(&self.settings);
        let mut assignment = TopicPartitionList::new();
        for &partition in &partitions {
            assignment
                .add_partition_offset(topic, partition, start)
                .map_err(|e| BusError::subscribe(topic, e))?;
        }
        consumer
            .assign(&assignment)
            .map_err(|e| BusError::subscribe(topic, e))?;

        let commit = self.settings.group_id.is_some();
        for (partition, queue) in queues {
            let consumer = consumer.clone();
            let handler = handler.clone();
            let topic = topic.to_string();
            let mut signal = self.tasks.signal();

            self.tasks.spawn(async move {
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut signal) => break,
                        next = queue.recv() => next.map(|msg| (inbound_message(&msg), msg.offset())),
                    };

                    let (inbound, offset) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(topic = %topic, partition, error = %err, "kafka receive failed");
                            continue;
                        }
                    };

                    let event = inbound.into_event();
                    let handled = if commit {
                        deliver_until_handled(
                            handler.as_ref(),
                            &topic,
                            partition,
                            &event,
                            Backoff::default(),
                            &mut signal,
                        )
                        .await
                    } else {
                        deliver(handler.as_ref(), &topic, partition, event).await
                    };

                    if let Some(next) = commit_target(commit, handled, offset) {
                        let mut position = TopicPartitionList::new();
                        let committed = position
                            .add_partition_offset(&topic, partition, Offset::Offset(next))
                            .and_then(|()| consumer.commit(&position, CommitMode::Async));
                        if let Err(err) = committed {
                            warn!(topic = %topic, partition, offset, error = %err, "failed to commit offset");
                        }
                    } else if commit {
                        // Shutdown interrupted redelivery; the group resumes here.
                        debug!(topic = %topic, partition, offset, "leaving offset uncommitted");
                        break;
                    }
                }
            });
        }

        // The main queue must keep being polled for partition queues to be fed.
        let poller = consumer;
        let poll_topic = topic.to_string();
        let mut signal = self.tasks.signal();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut signal) => break,
                    next = poller.recv() => match next {
                        Ok(msg) => warn!(
                            topic = %poll_topic,
                            partition = msg.partition(),
                            offset = msg.offset(),
                            "message reached the main queue and was not delivered"
                        ),
                        Err(err) => warn!(topic = %poll_topic, error = %err, "kafka consumer error"),
                    },
                }
            }
        });

        info!(topic, partitions = partitions.len(), commit, "kafka subscription started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        self.tasks.close().await;

        let producer = self.producer.clone();
        let timeout = self.settings.publish_timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BusError::connection(BACKEND, e))?;
        if let Err(err) = flushed {
            warn!(error = %err, "kafka producer flush incomplete at shutdown");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> KafkaSettings {
        KafkaSettings::new(["k1:9092", "k2:9092"])
    }

    #[test]
    fn producer_is_idempotent_with_bounded_retries() {
        let config = producer_config(&settings().with_publish_timeout(Duration::from_millis(750)));
        assert_eq!(config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("retries"), Some("5"));
        assert_eq!(config.get("message.timeout.ms"), Some("750"));
    }

    #[test]
    fn consumer_never_auto_commits() {
        let config = consumer_config(&settings());
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("group.id"), Some(EPHEMERAL_GROUP));

        let config = consumer_config(&settings().with_group_id("ingest").with_start_offset(StartOffset::Earliest));
        assert_eq!(config.get("group.id"), Some("ingest"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn security_settings_reach_both_clients() {
        let s = settings().with_sasl("user", "pass", "SCRAM-SHA-256");
        for config in [producer_config(&s), consumer_config(&s)] {
            assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
            assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
            assert_eq!(config.get("sasl.username"), Some("user"));
        }
    }

    #[test]
    fn start_position_follows_group_and_offset_settings() {
        assert_eq!(start_position(&settings()), Offset::End);
        assert_eq!(
            start_position(&settings().with_start_offset(StartOffset::Earliest)),
            Offset::Beginning
        );
        assert_eq!(start_position(&settings().with_group_id("g")), Offset::Stored);
    }

    #[test]
    fn offsets_are_committed_only_after_success_in_a_group() {
        assert_eq!(commit_target(true, true, 41), Some(42));
        assert_eq!(commit_target(true, false, 41), None);
        assert_eq!(commit_target(false, true, 41), None);
        assert_eq!(commit_target(false, false, 41), None);
    }

    #[test]
    fn timed_out_deliveries_map_to_timeout() {
        let err = publish_error(
            "events",
            Duration::from_secs(1),
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut),
        );
        assert!(matches!(err, BusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_publish_and_subscribe() {
        let bus = KafkaEventBus::connect(
            KafkaSettings::new(["127.0.0.1:1"]).with_publish_timeout(Duration::from_millis(500)),
        )
        .unwrap();

        let err = bus
            .publish("events", &Event::new("a1", "EventType1", "x"))
            .await
            .unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");

        let handler = tidemark_events::handler_fn(|_| async { Ok(()) });
        let err = bus.consumer_event("events", handler).await.unwrap_err();
        assert!(matches!(err, BusError::Subscribe { .. }));

        bus.shutdown().await.unwrap();
    }
}
