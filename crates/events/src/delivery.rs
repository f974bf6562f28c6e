//! Delivery-loop bookkeeping shared by every bus backend.
//!
//! A backend spawns one loop per topic-partition (or subject) through
//! [`DeliveryTasks::spawn`]. Loops watch the shutdown signal between
//! messages, so a handler invocation that already started always runs to
//! completion before [`DeliveryTasks::close`] returns.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use tidemark_core::Event;

use crate::error::BusError;
use crate::handler::EventHandler;

/// Delay schedule between redeliveries of a failed event: doubles from
/// `initial` and is capped at `max`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug)]
pub struct DeliveryTasks {
    backend: &'static str,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryTasks {
    pub fn new(backend: &'static str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// `Err(BusError::Closed)` once shutdown has started.
    pub fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// A receiver that observes the shutdown signal; pass it to
    /// [`shutdown_requested`] inside a delivery loop.
    pub fn signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// Number of live delivery loops.
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every loop to stop and wait until they have.
    ///
    /// Idempotent: later calls return once the (already empty) task list is joined.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let handles = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let count = handles.len();

        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(backend = self.backend, error = %err, "delivery loop ended abnormally");
            }
        }

        debug!(backend = self.backend, loops = count, "delivery loops stopped");
    }
}

/// Stable partition index for `key` among `partitions` lanes.
///
/// All events sharing a key land on the same lane for the lifetime of the
/// process.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    use std::hash::{DefaultHasher, Hash, Hasher};

    if partitions <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// Resolve once shutdown has been signalled (or the sender is gone).
pub async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Deliver `event` until the handler succeeds, sleeping per `backoff`
/// between attempts. The calling loop (one partition) makes no progress
/// meanwhile, so later events of the partition are never handled ahead of
/// this one.
///
/// Returns `false` only when shutdown was signalled before the handler
/// succeeded; the event must then not be acknowledged.
pub async fn deliver_until_handled(
    handler: &dyn EventHandler,
    topic: &str,
    partition: i32,
    event: &Event,
    backoff: Backoff,
    signal: &mut watch::Receiver<bool>,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        if deliver(handler, topic, partition, event.clone()).await {
            return true;
        }
        attempt = attempt.saturating_add(1);
        let delay = backoff.delay(attempt);
        warn!(
            topic,
            partition,
            event_id = %event.id,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            "redelivering event"
        );
        tokio::select! {
            biased;
            _ = shutdown_requested(signal) => return false,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Invoke `handler` for one event, logging failures and panics instead of
/// letting them end the delivery loop.
///
/// Returns `true` when the handler reported success.
pub async fn deliver(handler: &dyn EventHandler, topic: &str, partition: i32, event: Event) -> bool {
    let event_id = event.id.clone();

    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(
                topic,
                partition,
                event_id = %event_id,
                error = %err,
                "event handler failed"
            );
            false
        }
        Err(_) => {
            error!(
                topic,
                partition,
                event_id = %event_id,
                "event handler panicked"
            );
            false
        }
    }
}
