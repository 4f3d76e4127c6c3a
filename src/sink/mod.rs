//! Profile persistence.
//!
//! The consumer worker hands every decoded event to a `ProfileSink`. A sink
//! call returns only once its change has committed, so the worker can ack
//! right after it.
//!
//! Implementations:
//! - `InMemoryProfileStore`: standalone mode and tests
//! - `SqliteProfileStore`: the `users` table (feature `sqlite`)

use async_trait::async_trait;

use crate::event::Payload;

mod memory;
mod profile;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::{InMemoryProfileStore, SinkOp};
pub use profile::{Gender, Profile};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProfileStore;

/// Errors from a profile sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The payload can never be stored as given.
    #[error("Invalid profile: {0}")]
    Validation(String),

    #[error("Profile {0} not found")]
    NotFound(i64),

    /// The store is unreachable or failed mid-transaction.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SinkError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Storage(_))
    }
}

/// Applies profile lifecycle events to durable storage.
///
/// Every method must be safe to repeat: deliveries are at-least-once.
#[async_trait]
pub trait ProfileSink: Send + Sync + 'static {
    /// Store a new profile. Replaces an existing one with the same id.
    async fn create(&self, entity_id: i64, payload: &Payload) -> Result<(), SinkError>;

    /// Merge the payload's fields into an existing profile.
    async fn update(&self, entity_id: i64, payload: &Payload) -> Result<(), SinkError>;

    /// Remove a profile. Removing a missing profile succeeds.
    async fn delete(&self, entity_id: i64) -> Result<(), SinkError>;
}
