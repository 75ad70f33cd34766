//! Queue message schemas and broker mechanics.
//!
//! - `message`: the two payloads that travel through the broker
//! - `broker`: transport-agnostic channel contract (declare, publish, consume, ack)
//! - `in_memory_broker`: in-process broker for tests/dev

pub mod broker;
pub mod in_memory_broker;
pub mod message;

pub use broker::{
    Acknowledger, BrokerChannel, BrokerConnector, BrokerError, DeadLetter, Delivery,
    DeliveryStream, OutgoingMessage, QueueSpec,
};
pub use in_memory_broker::{BrokerStats, InMemoryBroker, InMemoryChannel, MessageProperties};
pub use message::{decode, encode, CodecError, QueueMessage, SubmitMessage, UpdateMessage, CONTENT_TYPE_JSON};
