//! Dead-letter queue.
//!
//! Messages that can never be processed (undecodable bodies, permanent
//! handler failures) are wrapped in a `DeadLetter` and published to the
//! dead-letter exchange for manual review and replay, instead of being
//! redelivered forever.
//!
//! ## Message Format
//!
//! A MessagePack map carrying the original body untouched plus why and when
//! it failed. The routing key on the dead-letter exchange is the queue the
//! message was consumed from, so reviewers can filter by source.
//!
//! The publisher borrows nothing from the channel pool: the caller passes the
//! channel to publish on. A worker reserves one per session.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::broker::{BrokerChannel, BrokerError, Delivery, Routed};
use crate::event::ProfileEvent;
use crate::topology::{TopologyError, TopologyManager};

/// Errors that can occur while dead-lettering.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to serialize dead letter: {0}")]
    Serialization(String),

    #[error("Dead-letter topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("Failed to publish dead letter: {0}")]
    Publish(#[from] BrokerError),

    #[error("Dead letter was unroutable on '{0}'")]
    Unroutable(String),
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterKind {
    /// The body did not decode.
    Malformed,
    /// The handler failed permanently.
    Rejected,
}

/// Dead letter queue entry for a failed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Queue the message was consumed from.
    pub source_queue: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Human-readable reason for rejection.
    pub reason: String,
    pub kind: DeadLetterKind,
    /// Known only when the body decoded.
    pub entity_id: Option<i64>,
    /// Original message body.
    pub body: Vec<u8>,
    /// RFC 3339 time of the failure.
    pub failed_at: String,
}

impl DeadLetter {
    /// Dead letter for a body that failed to decode.
    pub fn malformed(source_queue: &str, delivery: &Delivery, reason: impl Into<String>) -> Self {
        Self::build(source_queue, delivery, reason.into(), DeadLetterKind::Malformed, None)
    }

    /// Dead letter for an event the handler rejected.
    pub fn rejected(
        source_queue: &str,
        delivery: &Delivery,
        event: &ProfileEvent,
        reason: impl Into<String>,
    ) -> Self {
        Self::build(
            source_queue,
            delivery,
            reason.into(),
            DeadLetterKind::Rejected,
            Some(event.entity_id()),
        )
    }

    fn build(
        source_queue: &str,
        delivery: &Delivery,
        reason: String,
        kind: DeadLetterKind,
        entity_id: Option<i64>,
    ) -> Self {
        Self {
            source_queue: source_queue.to_string(),
            routing_key: delivery.routing_key().to_string(),
            reason,
            kind,
            entity_id,
            body: delivery.body().to_vec(),
            failed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DlqError> {
        rmp_serde::to_vec_named(self).map_err(|e| DlqError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DlqError> {
        rmp_serde::from_slice(bytes).map_err(|e| DlqError::Serialization(e.to_string()))
    }
}

/// Publishes dead letters to the dead-letter exchange.
#[derive(Debug, Clone)]
pub struct DeadLetterPublisher {
    topology: TopologyManager,
}

impl DeadLetterPublisher {
    pub fn new(topology: TopologyManager) -> Self {
        Self { topology }
    }

    pub async fn publish<Ch: BrokerChannel + ?Sized>(
        &self,
        channel: &Ch,
        letter: &DeadLetter,
    ) -> Result<(), DlqError> {
        let body = letter.encode()?;
        self.topology.ensure_dead_letter(channel).await?;

        let exchange = &self.topology.config().dead_letter_exchange;
        match channel
            .publish(exchange, &letter.source_queue, &body)
            .await?
        {
            Routed::Delivered => {
                debug!(
                    source_queue = %letter.source_queue,
                    kind = ?letter.kind,
                    "Published dead letter"
                );
                Ok(())
            }
            Routed::Unroutable => {
                error!(exchange = %exchange, "Dead letter unroutable");
                Err(DlqError::Unroutable(exchange.clone()))
            }
        }
    }
}
