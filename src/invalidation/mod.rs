//! Fleet-wide cache invalidation over a message bus.
//!
//! Model writes emit lifecycle signals; the publisher turns them into `del`
//! messages on a broadcast topic, and every subscriber evicts the cached pages
//! that depended on the changed instance.

mod bus;
mod consumer;
mod error;
mod message;
mod publisher;
mod signals;
pub mod stomp;

pub use bus::{BusConnection, BusConnector, BusTransport, MemoryBroker, MessageSource};
pub use consumer::{InvalidationConsumer, TestPredicate};
pub use error::{BusError, PublishError};
pub use message::{InvalidationMessage, MessageType, UnknownMessageType};
pub use publisher::InvalidationPublisher;
pub use signals::{
    ContentInstance, InstanceSnapshot, Model, MutationPhase, MutationSignal, SignalBus,
    object_key, register_signal_hooks,
};
