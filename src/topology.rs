//! Exchange and queue topology.
//!
//! Everything is declared idempotently before use: publishing and consuming
//! both call `ensure` first, so a fresh broker needs no out-of-band setup.

use serde::Deserialize;
use tracing::{debug, error};

use crate::broker::{BrokerChannel, BrokerError, ExchangeSpec, QueueSpec};
use crate::routing;

/// Errors from topology declaration.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// An existing exchange or queue has incompatible arguments.
    /// Not retried: an operator has to resolve it.
    #[error("Topology mismatch declaring {entity}: {reason}")]
    Mismatch { entity: String, reason: String },

    #[error("Broker error: {0}")]
    Broker(BrokerError),
}

impl TopologyError {
    fn from_broker(entity: &str, err: BrokerError) -> Self {
        match err {
            BrokerError::PreconditionFailed(reason) => {
                error!(entity = %entity, reason = %reason, "Conflicting topology declaration");
                TopologyError::Mismatch {
                    entity: entity.to_string(),
                    reason,
                }
            }
            other => TopologyError::Broker(other),
        }
    }
}

/// Names of the exchanges and queues.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchange: String,
    pub shared_queue: String,
    pub shared_routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            exchange: routing::EXCHANGE.to_string(),
            shared_queue: routing::SHARED_QUEUE.to_string(),
            shared_routing_key: routing::SHARED_ROUTING_KEY.to_string(),
            dead_letter_exchange: routing::DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: routing::DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

/// Declares the exchange, the shared queue, per-user queues and the
/// dead-letter path.
#[derive(Debug, Clone, Default)]
pub struct TopologyManager {
    config: TopologyConfig,
}

impl TopologyManager {
    pub fn new(config: TopologyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Make sure the exchange and shared queue exist and are bound, plus the
    /// queue for `entity_id` when given. Safe to call any number of times.
    pub async fn ensure<Ch>(&self, channel: &Ch, entity_id: Option<i64>) -> Result<(), TopologyError>
    where
        Ch: BrokerChannel + ?Sized,
    {
        let exchange = &self.config.exchange;

        channel
            .declare_exchange(&ExchangeSpec::topic(exchange.as_str()))
            .await
            .map_err(|e| TopologyError::from_broker(exchange, e))?;

        self.ensure_bound_queue(channel, &self.config.shared_queue, &self.config.shared_routing_key)
            .await?;

        if let Some(id) = entity_id {
            self.ensure_bound_queue(
                channel,
                &routing::entity_queue(id),
                &routing::entity_routing_key(id),
            )
            .await?;
        }

        Ok(())
    }

    /// Declare the dead-letter exchange and a queue catching everything on it.
    pub async fn ensure_dead_letter<Ch>(&self, channel: &Ch) -> Result<(), TopologyError>
    where
        Ch: BrokerChannel + ?Sized,
    {
        let exchange = &self.config.dead_letter_exchange;
        let queue = &self.config.dead_letter_queue;

        channel
            .declare_exchange(&ExchangeSpec::topic(exchange.as_str()))
            .await
            .map_err(|e| TopologyError::from_broker(exchange, e))?;
        channel
            .declare_queue(&QueueSpec::durable(queue.as_str()))
            .await
            .map_err(|e| TopologyError::from_broker(queue, e))?;
        channel
            .bind_queue(queue, exchange, "#")
            .await
            .map_err(|e| TopologyError::from_broker(queue, e))?;

        debug!(exchange = %exchange, queue = %queue, "Dead-letter topology ready");
        Ok(())
    }

    async fn ensure_bound_queue<Ch>(
        &self,
        channel: &Ch,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), TopologyError>
    where
        Ch: BrokerChannel + ?Sized,
    {
        channel
            .declare_queue(&QueueSpec::durable(queue))
            .await
            .map_err(|e| TopologyError::from_broker(queue, e))?;
        channel
            .bind_queue(queue, &self.config.exchange, routing_key)
            .await
            .map_err(|e| TopologyError::from_broker(queue, e))?;

        debug!(queue = %queue, routing_key = %routing_key, "Queue bound");
        Ok(())
    }
}
