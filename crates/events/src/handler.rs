use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use tidemark_core::Event;

use crate::error::HandlerError;

/// Consumer-side callback invoked once per delivered event.
///
/// Delivery is at-least-once, so implementations must tolerate redelivery of
/// the same event id. A handler registered on a partitioned topic is invoked
/// concurrently from one delivery loop per partition; within a single
/// partition invocations are strictly sequential.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a shareable handler.
///
/// ```ignore
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// bus.consumer_event("orders", handler_fn(move |event| {
///     let sink = sink.clone();
///     async move {
///         sink.lock().unwrap().push(event);
///         Ok(())
///     }
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        (self.f)(event).await
    }
}
