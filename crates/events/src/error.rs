use std::time::Duration;

use thiserror::Error;

/// Event bus operation error.
///
/// Every variant names the topic (or backend) it concerns so a caller can log
/// the error without extra context.
#[derive(Debug, Error)]
pub enum BusError {
    /// Unknown backend, missing settings, or a backend compiled out.
    #[error("invalid event bus configuration: {0}")]
    Config(String),

    #[error("connection to {backend} failed: {reason}")]
    Connection { backend: &'static str, reason: String },

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("publish to '{topic}' was not acknowledged within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("event bus is shut down")]
    Closed,
}

impl BusError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(backend: &'static str, reason: impl ToString) -> Self {
        Self::Connection {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn publish(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub fn subscribe(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(topic: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            topic: topic.into(),
            timeout,
        }
    }

    /// Transport-level failures (as opposed to configuration or lifecycle errors).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BusError::Connection { .. } | BusError::Publish { .. } | BusError::Timeout { .. }
        )
    }
}

/// Failure reported by an [`EventHandler`](crate::EventHandler).
///
/// Handler failures never stop a delivery loop; they are logged with the
/// topic and partition the event came from.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{err:#}"))
    }
}
