//! Profile event publisher.
//!
//! Each publish borrows one pooled channel, makes sure the topology for the
//! event's user exists, then sends the encoded event once per routing key of
//! the chosen audience. There is no internal retry: the caller gets the error
//! and decides.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::broker::{BrokerChannel, BrokerError, Connector, Routed};
use crate::codec::{self, EncodeError};
use crate::event::{Action, EventError, Payload, ProfileEvent};
use crate::metrics::PublishMetrics;
use crate::pool::{ChannelPool, PoolError};
use crate::routing::Audience;
use crate::topology::{TopologyError, TopologyManager};

/// Errors that can occur during publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// No channel could be obtained, or it died mid-publish.
    #[error("Broker connection unavailable: {0}")]
    Connection(String),

    #[error("Topology conflict: {0}")]
    Topology(TopologyError),

    /// Nothing is bound for this key: the topology is misconfigured.
    #[error("No queue bound for routing key '{routing_key}'")]
    Unroutable { routing_key: String },

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Broker error: {0}")]
    Broker(BrokerError),

    #[error("Invalid event: {0}")]
    Invalid(#[from] EventError),

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

impl From<BrokerError> for PublishError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Connection(msg) => PublishError::Connection(msg),
            other => PublishError::Broker(other),
        }
    }
}

impl From<PoolError> for PublishError {
    fn from(err: PoolError) -> Self {
        PublishError::Connection(err.to_string())
    }
}

impl From<TopologyError> for PublishError {
    fn from(err: TopologyError) -> Self {
        match err {
            TopologyError::Broker(broker) => broker.into(),
            mismatch => PublishError::Topology(mismatch),
        }
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Audience used by `publish` and `publish_action`.
    pub audience: Audience,
    /// Upper bound on one publish call, channel wait included.
    pub publish_timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            audience: Audience::default(),
            publish_timeout_ms: 10_000,
        }
    }
}

/// Publishes profile events to the topic exchange.
pub struct Publisher<C: Connector> {
    pool: ChannelPool<C>,
    topology: TopologyManager,
    config: PublisherConfig,
    metrics: Arc<PublishMetrics>,
}

impl<C: Connector> Publisher<C> {
    pub fn new(pool: ChannelPool<C>, topology: TopologyManager, config: PublisherConfig) -> Self {
        Self {
            pool,
            topology,
            config,
            metrics: Arc::new(PublishMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &Arc<PublishMetrics> {
        &self.metrics
    }

    /// Front-end entry point: build the event and publish it to the default
    /// audience.
    pub async fn publish_action(
        &self,
        entity_id: i64,
        action: Action,
        payload: Payload,
    ) -> Result<(), PublishError> {
        let event = ProfileEvent::new(entity_id, action, payload).map_err(|e| {
            warn!(entity_id = entity_id, action = %action, error = %e, "Refusing to publish invalid event");
            self.metrics.record_failed();
            PublishError::from(e)
        })?;

        self.publish(&event).await
    }

    pub async fn publish(&self, event: &ProfileEvent) -> Result<(), PublishError> {
        self.publish_to(event, self.config.audience).await
    }

    /// Publish to an explicit audience. `Audience::Both` sends the event
    /// twice, once per key, and succeeds only if both sends do.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(entity_id = event.entity_id(), action = %event.action())
    )]
    pub async fn publish_to(
        &self,
        event: &ProfileEvent,
        audience: Audience,
    ) -> Result<(), PublishError> {
        let limit = Duration::from_millis(self.config.publish_timeout_ms);

        let result = match tokio::time::timeout(limit, self.send(event, audience)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(limit)),
        };

        match &result {
            Ok(()) => {
                self.metrics.record_sent();
                debug!(audience = ?audience, "Published profile event");
            }
            Err(e) => {
                self.metrics.record_failed();
                error!(
                    entity_id = event.entity_id(),
                    action = %event.action(),
                    audience = ?audience,
                    error = %e,
                    "Failed to publish profile event"
                );
            }
        }
        result
    }

    async fn send(&self, event: &ProfileEvent, audience: Audience) -> Result<(), PublishError> {
        let channel = self.pool.acquire().await?;
        self.topology
            .ensure(&*channel, Some(event.entity_id()))
            .await?;

        let body = codec::encode(event)?;
        let config = self.topology.config();

        for routing_key in audience.routing_keys(&config.shared_routing_key, event.entity_id()) {
            match channel.publish(&config.exchange, &routing_key, &body).await? {
                Routed::Delivered => {
                    debug!(exchange = %config.exchange, routing_key = %routing_key, "Sent");
                }
                Routed::Unroutable => return Err(PublishError::Unroutable { routing_key }),
            }
        }

        Ok(())
    }
}
