//! Event distribution mechanics: the bus contract, handlers, the in-process
//! bus and the projection contract.
//!
//! Broker-backed buses (Kafka, NATS, Redis) live in `tidemark-infra`.

pub mod bus;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;

pub use bus::EventBus;
pub use delivery::DeliveryTasks;
pub use envelope::{headers, InboundMessage};
pub use error::{BusError, HandlerError};
pub use handler::{handler_fn, EventHandler};
pub use in_memory_bus::InMemoryEventBus;
pub use projection::Projection;

pub use tidemark_core::Event;
