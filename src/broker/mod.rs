//! Message broker abstraction.
//!
//! This module contains:
//! - `Connector` trait: opens channels against a broker
//! - `BrokerChannel` trait: declare, bind, publish and consume on one channel
//! - `Delivery`: a received message that must be settled exactly once
//! - Implementations: AMQP (RabbitMQ), in-memory

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnector};
pub use memory::{MemoryBroker, MemoryChannel};

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors reported by a broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The broker refused a declaration that conflicts with an existing one.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Publish not confirmed: {0}")]
    Nacked(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl BrokerError {
    /// Whether the failure came from a lost connection or closed channel.
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// Outcome of a mandatory publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// At least one bound queue accepted the message.
    Delivered,
    /// No binding matched; the broker returned the message.
    Unroutable,
}

// ============================================================================
// Deliveries
// ============================================================================

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message received from a queue.
///
/// Settling consumes the delivery, so each message is acked, nacked or
/// rejected at most once. A delivery dropped unsettled stays with the broker
/// and is redelivered when its channel closes.
pub struct Delivery {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// True when the broker has delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Positive acknowledgment: the broker forgets the message.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negative acknowledgment, optionally putting the message back.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    /// Reject, optionally putting the message back.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Traits
// ============================================================================

/// One broker channel.
///
/// Declarations are idempotent: re-declaring with identical arguments is a
/// no-op, conflicting arguments fail with `BrokerError::PreconditionFailed`.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a persistent message with the mandatory flag set.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<Routed>;

    /// Start consuming a queue with at most `prefetch` unacknowledged messages.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    /// False once the channel or its connection has closed.
    fn is_open(&self) -> bool;
}

/// Opens channels. Implementations own the underlying connection and
/// reconnect when it has dropped.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel>;
}
