//! In-process partitioned event bus for tests, dev and single-node setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use tidemark_core::{Event, UNSET_TIMESTAMP};

use crate::bus::EventBus;
use crate::delivery::{deliver, partition_for, shutdown_requested, DeliveryTasks};
use crate::error::BusError;
use crate::handler::EventHandler;

/// One sender per partition lane of a single subscription.
type Lanes = Vec<mpsc::UnboundedSender<Event>>;

/// In-process pub/sub bus.
///
/// - Every topic has `partitions` lanes; keyed events (`publish`) hash their
///   aggregate id onto a lane, raw payloads (`publish_event`) round-robin.
/// - Each subscription gets a copy of every message (broadcast) and runs one
///   sequential delivery task per lane.
/// - Publishing to a topic with no subscribers succeeds and delivers nothing,
///   like broker pub/sub without retention.
#[derive(Debug)]
pub struct InMemoryEventBus {
    partitions: usize,
    topics: Mutex<HashMap<String, Vec<Lanes>>>,
    next_unkeyed: AtomicUsize,
    tasks: DeliveryTasks,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: Mutex::new(HashMap::new()),
            next_unkeyed: AtomicUsize::new(0),
            tasks: DeliveryTasks::new("memory"),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn route(&self, topic: &str, event: Event, partition: usize) -> Result<(), BusError> {
        self.tasks.ensure_open()?;

        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BusError::publish(topic, "topic registry lock poisoned"))?;

        if let Some(subscriptions) = topics.get_mut(topic) {
            // Drop subscriptions whose delivery loops have ended.
            subscriptions.retain(|lanes| lanes[partition].send(event.clone()).is_ok());
        }

        Ok(())
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::with_partitions(1)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn publish_event(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let event = Event {
            id: String::new(),
            aggregate_id: String::new(),
            event_type: String::new(),
            data: String::from_utf8_lossy(payload).into_owned(),
            timestamp: UNSET_TIMESTAMP,
        };
        let partition = self.next_unkeyed.fetch_add(1, Ordering::Relaxed) % self.partitions;
        self.route(topic, event, partition)
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<(), BusError> {
        let partition = partition_for(&event.aggregate_id, self.partitions);
        self.route(topic, event.clone(), partition)
    }

    async fn consumer_event(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        self.tasks.ensure_open()?;

        let mut lanes = Vec::with_capacity(self.partitions);
        for partition in 0..self.partitions {
            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            lanes.push(tx);

            let handler = handler.clone();
            let topic = topic.to_string();
            let mut signal = self.tasks.signal();

            self.tasks.spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut signal) => break,
                        next = rx.recv() => match next {
                            Some(event) => {
                                deliver(handler.as_ref(), &topic, partition as i32, event).await;
                            }
                            None => break,
                        },
                    }
                }
            });
        }

        self.topics
            .lock()
            .map_err(|_| BusError::subscribe(topic, "topic registry lock poisoned"))?
            .entry(topic.to_string())
            .or_default()
            .push(lanes);

        debug!(topic, partitions = self.partitions, "in-memory subscription registered");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        self.tasks.close().await;
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }
}
