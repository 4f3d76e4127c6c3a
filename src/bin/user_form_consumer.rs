//! user-form-consumer: persistence worker
//!
//! Drains the shared `user_messages` queue into the SQLite `users` table.
//!
//! ## Architecture
//! ```text
//! [front-end] --publish--> (user_form exchange) --user_messages--> [user-form-consumer]
//!                                                                        |
//!                                                                        v
//!                                                                     SQLite
//! ```
//!
//! ## Configuration
//! - config.yaml / USER_FORM_CONFIG: YAML configuration file
//! - USER_FORM__AMQP__URL: broker URL
//! - USER_FORM__STORAGE__PATH: SQLite database file
//! - USER_FORM_LOG: log filter (default: info)
//!
//! Ctrl-C stops taking new messages, finishes in-flight ones, then exits.

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};

use user_form_bus::broker::AmqpConnector;
use user_form_bus::config::Config;
use user_form_bus::sink::SqliteProfileStore;
use user_form_bus::utils::bootstrap::init_tracing;
use user_form_bus::{ChannelPool, ConsumerWorker, TopologyManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;

    let db = SqlitePoolOptions::new()
        .connect(&config.storage.sqlite_url())
        .await?;
    let store = SqliteProfileStore::new(db);
    store.init().await?;

    let connector = AmqpConnector::new(config.amqp.url.as_str())?;
    let pool = ChannelPool::new(connector, &config.pool)?;
    let topology = TopologyManager::new(config.topology.clone());

    let worker = ConsumerWorker::new(
        pool.clone(),
        topology,
        Arc::new(store),
        config.worker.clone(),
    );
    let queue = worker.queue().to_string();
    let handle = worker.spawn();

    info!(queue = %queue, storage = %config.storage.path, "user-form-consumer started");

    handle
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                // Without a signal handler, run until the worker stops.
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested, draining in-flight messages");
        })
        .await?;

    pool.close();
    info!("user-form-consumer stopped");
    Ok(())
}
