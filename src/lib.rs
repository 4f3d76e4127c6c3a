//! user-form-bus - profile lifecycle events over a topic exchange
//!
//! When a user's profile is created, updated or deleted, the front-end
//! publishes a `ProfileEvent`. The broker routes it by topic to a shared
//! queue drained by the persistence worker and, when asked, to a per-user
//! queue for that user's subscribers.
//!
//! - `codec`: MessagePack wire format
//! - `routing`: exchange, queue and routing-key names
//! - `broker`: AMQP and in-memory brokers behind one channel trait
//! - `pool`: bounded channel pool
//! - `topology`: idempotent exchange and queue declaration
//! - `publisher`: publish with confirmation and counters
//! - `worker`: consume, dispatch to a `ProfileSink`, ack/requeue/dead-letter
//! - `sink`: profile persistence

pub mod broker;
pub mod codec;
pub mod config;
pub mod dlq;
pub mod event;
pub mod metrics;
pub mod pool;
pub mod publisher;
pub mod routing;
pub mod sink;
pub mod topology;
pub mod utils;
pub mod worker;

pub use event::{Action, EventError, Payload, ProfileEvent};
pub use pool::{ChannelPool, PoolConfig, PoolError};
pub use publisher::{PublishError, Publisher, PublisherConfig};
pub use routing::Audience;
pub use sink::{ProfileSink, SinkError};
pub use topology::{TopologyConfig, TopologyError, TopologyManager};
pub use worker::{ConsumeError, ConsumerWorker, HandlerError, WorkerConfig, WorkerHandle};
