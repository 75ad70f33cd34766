//! Broker channel abstraction (mechanics only).
//!
//! The contract mirrors the subset of AMQP 0-9-1 this system relies on:
//!
//! - **Direct exchanges**: a message goes to every queue bound with its routing key
//! - **Durable queues** with an optional dead-letter exchange + routing key
//! - **Publisher confirms**: `publish` resolves only once the broker confirmed
//! - **Manual acknowledgement**: every delivery ends in ack, nack or reject
//! - **Prefetch**: at most N unacknowledged deliveries per consumer
//!
//! Delivery is at-least-once. A delivery that is dropped without being settled
//! is returned to its queue by the broker.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("no broker channel is open")]
    NotConnected,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("declaration failed: {0}")]
    Declare(String),

    #[error("publish was not confirmed by the broker: {0}")]
    PublishNacked(String),

    #[error("publish confirm timed out after {0:?}")]
    ConfirmTimeout(Duration),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("broker protocol error: {0}")]
    Protocol(String),
}

/// Where a queue sends rejected or expired messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetter>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.dead_letter = Some(DeadLetter {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }
}

/// An encoded message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    /// Must survive a broker restart (delivery mode 2).
    pub persistent: bool,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, to be settled exactly once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// An open channel on a broker connection.
///
/// Implementations must be safe to share between one publisher and one
/// consumer in the same process.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare a durable direct exchange (idempotent).
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare a queue (idempotent).
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Ready-message count of an existing queue (passive declare).
    async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<(), BrokerError>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Opens broker channels.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Connect and open a channel with the given prefetch (0 = unlimited).
    async fn connect(&self, prefetch: u16) -> Result<Self::Channel, BrokerError>;
}
