//! Broker plumbing: topology, publishing, consuming.
//!
//! - `topology`: connection lifecycle + exchange/queue/DLQ declaration
//! - `publisher`: confirmed persistent publishing
//! - `consumer`: decode, bounded dispatch, ack/nack/reject, graceful stop
//! - `amqp`: `lapin` channel adapter (feature `amqp`)

pub mod consumer;
pub mod publisher;
pub mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use consumer::{Consumer, ConsumerError, ConsumerOptions, ConsumerState, HandlerError, MessageHandler};
pub use publisher::{PublishError, Publisher};
pub use topology::TopologyManager;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnector};
