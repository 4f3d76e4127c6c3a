//! Bounded pool of broker channels.
//!
//! Built on `deadpool`'s managed pool. A `PooledChannel` is a guard: it goes
//! back to the pool when dropped, whatever path the borrower leaves by.
//! Channels that have closed underneath the pool are thrown away on recycle,
//! so the next acquisition opens a fresh one (and reconnects if needed).

use std::time::Duration;

use deadpool::managed::{self, Metrics, Object, RecycleError, RecycleResult};
use deadpool::Runtime;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, BrokerError, Connector};

/// Errors from channel acquisition.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Timed out waiting for a channel")]
    Timeout,

    #[error("Failed to open channel: {0}")]
    Backend(#[from] BrokerError),

    #[error("Pool is closed")]
    Closed,

    #[error("Failed to build pool: {0}")]
    Build(String),
}

/// Pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum open channels.
    pub max_size: usize,
    /// How long an acquisition waits for a free channel.
    pub wait_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            wait_timeout_ms: 5_000,
        }
    }
}

/// Opens and health-checks channels for the pool.
pub struct ChannelManager<C> {
    connector: C,
}

impl<C: Connector> managed::Manager for ChannelManager<C> {
    type Type = C::Channel;
    type Error = BrokerError;

    async fn create(&self) -> Result<C::Channel, BrokerError> {
        let channel = self.connector.open_channel().await?;
        debug!("Pool opened channel");
        Ok(channel)
    }

    async fn recycle(&self, channel: &mut C::Channel, _: &Metrics) -> RecycleResult<BrokerError> {
        if channel.is_open() {
            Ok(())
        } else {
            warn!("Discarding closed channel");
            Err(RecycleError::Backend(BrokerError::Connection(
                "channel closed".to_string(),
            )))
        }
    }
}

/// A channel borrowed from the pool. Dereferences to the channel.
pub type PooledChannel<C> = Object<ChannelManager<C>>;

/// Bounded, shared set of channels over one connector.
pub struct ChannelPool<C: Connector> {
    pool: managed::Pool<ChannelManager<C>>,
}

impl<C: Connector> Clone for ChannelPool<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<C: Connector> ChannelPool<C> {
    pub fn new(connector: C, config: &PoolConfig) -> Result<Self, PoolError> {
        let pool = managed::Pool::builder(ChannelManager { connector })
            .max_size(config.max_size)
            .wait_timeout(Some(Duration::from_millis(config.wait_timeout_ms)))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Borrow a channel, waiting while the pool is exhausted.
    pub async fn acquire(&self) -> Result<PooledChannel<C>, PoolError> {
        self.pool.get().await.map_err(|e| match e {
            managed::PoolError::Timeout(_) => PoolError::Timeout,
            managed::PoolError::Backend(e) => PoolError::Backend(e),
            managed::PoolError::Closed => PoolError::Closed,
            other => PoolError::Backend(BrokerError::Connection(other.to_string())),
        })
    }

    /// Close the pool. Borrowed channels are dropped when returned.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn status(&self) -> deadpool::Status {
        self.pool.status()
    }
}
