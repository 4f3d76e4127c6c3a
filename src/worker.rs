//! Consumer worker.
//!
//! A long-running task that drains one queue into a `ProfileSink`:
//!
//! ```text
//! received -> decoding -> decode failed: dead-letter, or reject
//!                      -> handling -> ok: ack
//!                                  -> transient failure: wait, nack with requeue
//!                                  -> permanent failure: dead-letter, or reject
//! ```
//!
//! A message is acked only after the sink call returned, so a crash between
//! the two redelivers it. Up to `concurrency` messages are handled at once,
//! but never two for the same user. Lost connections are recovered by reconnecting with
//! backoff; a conflicting topology stops the worker.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{BrokerChannel, BrokerError, Connector, Delivery};
use crate::codec::{self, DecodeError};
use crate::dlq::{DeadLetter, DeadLetterPublisher};
use crate::event::{Action, ProfileEvent};
use crate::metrics::{ConsumerMetrics, Outcome};
use crate::pool::{ChannelPool, PoolError};
use crate::routing;
use crate::sink::{ProfileSink, SinkError};
use crate::topology::{TopologyError, TopologyManager};
use crate::utils::retry::{reconnect_backoff, MAX_RECONNECT_DELAY};

/// Errors that stop a consume session.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("No channel: {0}")]
    Pool(#[from] PoolError),

    #[error("Topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("Broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Invalid worker configuration: {0}")]
    Config(String),
}

impl ConsumeError {
    /// Errors reconnecting cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsumeError::Topology(TopologyError::Mismatch { .. })
                | ConsumeError::Join(_)
                | ConsumeError::Config(_)
        )
    }
}

/// A handler failure, classified for acknowledgment.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// May succeed later: the message is requeued.
    #[error("Transient handler failure: {0}")]
    Transient(String),

    /// Will never succeed: the message is dead-lettered.
    #[error("Permanent handler failure: {0}")]
    Permanent(String),
}

impl From<SinkError> for HandlerError {
    fn from(err: SinkError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Consume this user's queue instead of the shared one.
    pub entity_id: Option<i64>,
    pub consumer_tag: String,
    /// Broker-side limit on unacknowledged deliveries.
    pub prefetch: u16,
    /// Messages handled at once. Messages for the same user always run one
    /// after another, in delivery order.
    pub concurrency: usize,
    /// Pause before requeueing a transient failure.
    pub requeue_delay_ms: u64,
    /// Publish unprocessable messages to the dead-letter queue. When off
    /// they are rejected without requeue.
    pub dead_letter: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            entity_id: None,
            consumer_tag: "user-form-consumer".to_string(),
            prefetch: 10,
            concurrency: 4,
            requeue_delay_ms: 1_000,
            dead_letter: true,
        }
    }
}

enum SessionEnd {
    Shutdown,
    StreamEnded,
}

/// Keeps each user's events in delivery order while different users are
/// handled concurrently.
///
/// Every message for a user gets a `Turn` that waits for the previous
/// message of that user to finish.
#[derive(Default)]
struct EntityOrder {
    tails: HashMap<i64, oneshot::Receiver<()>>,
}

impl EntityOrder {
    fn next_turn(&mut self, entity_id: i64) -> Turn {
        let (done, tail) = oneshot::channel();
        let previous = self.tails.insert(entity_id, tail);
        Turn {
            previous,
            _done: done,
        }
    }

    /// Forget users with nothing in flight.
    fn prune(&mut self) {
        self.tails
            .retain(|_, tail| matches!(tail.try_recv(), Err(TryRecvError::Empty)));
    }

    fn len(&self) -> usize {
        self.tails.len()
    }
}

/// Dropping the turn releases the next message of the same user.
struct Turn {
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl Turn {
    async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Err means the previous handler finished without signalling.
            let _ = previous.await;
        }
    }
}

/// Consumes one queue into a profile sink.
pub struct ConsumerWorker<C: Connector, S: ProfileSink> {
    pool: ChannelPool<C>,
    topology: TopologyManager,
    sink: Arc<S>,
    dead_letters: Option<DeadLetterPublisher>,
    config: WorkerConfig,
    queue: String,
    metrics: Arc<ConsumerMetrics>,
}

impl<C: Connector, S: ProfileSink> ConsumerWorker<C, S> {
    pub fn new(
        pool: ChannelPool<C>,
        topology: TopologyManager,
        sink: Arc<S>,
        config: WorkerConfig,
    ) -> Self {
        let queue = match config.entity_id {
            Some(id) => routing::entity_queue(id),
            None => topology.config().shared_queue.clone(),
        };
        let dead_letters = config
            .dead_letter
            .then(|| DeadLetterPublisher::new(topology.clone()));

        Self {
            pool,
            topology,
            sink,
            dead_letters,
            config,
            queue,
            metrics: Arc::new(ConsumerMetrics::default()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    /// Start consuming on a background task.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::clone(&self.metrics);
        let worker = Arc::new(self);
        let task = tokio::spawn(worker.run(shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            task,
            metrics,
        }
    }

    /// Channels one session holds: the subscription, plus one reserved for
    /// dead letters.
    fn channels_per_session(&self) -> usize {
        if self.dead_letters.is_some() {
            2
        } else {
            1
        }
    }

    /// Consumer loop with automatic reconnection and exponential backoff
    /// with jitter.
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumeError> {
        let pool_size = self.pool.status().max_size;
        if pool_size < self.channels_per_session() {
            let e = ConsumeError::Config(format!(
                "pool max_size {} is below the {} channels a session needs",
                pool_size,
                self.channels_per_session()
            ));
            error!(queue = %self.queue, error = %e, "Consumer stopped");
            return Err(e);
        }

        let backoff_builder = reconnect_backoff();
        let mut backoff = backoff_builder.build();

        loop {
            // A dropped handle counts as a shutdown request.
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            match self.consume_session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::StreamEnded) => {
                    info!(queue = %self.queue, "Consumer stream ended, reconnecting");
                    backoff = backoff_builder.build();
                }
                Err(e) if e.is_fatal() => {
                    error!(queue = %self.queue, error = %e, "Consumer stopped");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        queue = %self.queue,
                        error = %e,
                        "Failed to set up consumer, retrying after backoff"
                    );
                }
            }

            let delay = backoff.next().unwrap_or(MAX_RECONNECT_DELAY);
            debug!(backoff_ms = %delay.as_millis(), "Waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(queue = %self.queue, "Consumer shut down");
        Ok(())
    }

    /// One subscription on one channel, until shutdown or the stream ends.
    /// In-flight messages are always settled before returning.
    async fn consume_session(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ConsumeError> {
        let channel = self.pool.acquire().await?;
        self.topology
            .ensure(&*channel, self.config.entity_id)
            .await?;

        // Reserved up front so dead-lettering never waits on the pool.
        let dead_letter_channel = match self.dead_letters {
            Some(_) => {
                let reserved = self.pool.acquire().await?;
                self.topology.ensure_dead_letter(&*reserved).await?;
                Some(Arc::new(reserved))
            }
            None => None,
        };

        let mut deliveries = channel
            .consume(&self.queue, &self.config.consumer_tag, self.config.prefetch)
            .await?;
        info!(queue = %self.queue, "Consumer connected, processing messages");

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        let mut order = EntityOrder::default();

        let end = loop {
            while in_flight.try_join_next().is_some() {}
            order.prune();

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break SessionEnd::Shutdown,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break SessionEnd::Shutdown,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break SessionEnd::Shutdown,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let decoded = codec::decode(delivery.body());
                    let mut turn = decoded
                        .as_ref()
                        .ok()
                        .map(|event| order.next_turn(event.entity_id()));
                    let worker = Arc::clone(self);
                    let dead_letter_channel = dead_letter_channel.clone();

                    in_flight.spawn(async move {
                        if let Some(turn) = turn.as_mut() {
                            turn.wait().await;
                        }
                        let reserved: Option<&C::Channel> =
                            dead_letter_channel.as_deref().map(|c| &**c);
                        worker.process(delivery, decoded, reserved).await;
                        drop(turn);
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "Consumer delivery error, will reconnect");
                    break SessionEnd::StreamEnded;
                }
                None => break SessionEnd::StreamEnded,
            }
        };

        let draining = in_flight.len();
        if draining > 0 {
            info!(queue = %self.queue, in_flight = draining, "Waiting for in-flight messages");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(queue = %self.queue, error = %e, "Message handler task failed");
            }
        }
        debug!(queue = %self.queue, users = order.len(), "Session drained");

        drop(deliveries);
        drop(dead_letter_channel);
        drop(channel);
        Ok(end)
    }

    /// Handle and settle one delivery.
    async fn process(
        &self,
        delivery: Delivery,
        decoded: Result<ProfileEvent, DecodeError>,
        dead_letter_channel: Option<&C::Channel>,
    ) {
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    routing_key = %delivery.routing_key(),
                    len = delivery.body().len(),
                    error = %e,
                    "Poison message"
                );
                let letter = DeadLetter::malformed(&self.queue, &delivery, e.to_string());
                self.dead_letter(delivery, letter, Outcome::Poison, dead_letter_channel)
                    .await;
                return;
            }
        };

        let span = tracing::info_span!(
            "bus.consume",
            queue = %self.queue,
            routing_key = %delivery.routing_key(),
            entity_id = event.entity_id(),
            action = %event.action(),
            redelivered = delivery.redelivered(),
        );

        async {
            let handled = AssertUnwindSafe(self.handle(&event))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HandlerError::Permanent("sink panicked".to_string())));

            match handled {
                Ok(()) => match delivery.ack().await {
                    Ok(()) => self.metrics.record(Outcome::Acked),
                    Err(e) => error!(error = %e, "Failed to ack message"),
                },
                Err(HandlerError::Transient(reason)) => {
                    warn!(reason = %reason, "Transient failure, requeueing");
                    tokio::time::sleep(Duration::from_millis(self.config.requeue_delay_ms)).await;
                    match delivery.nack(true).await {
                        Ok(()) => self.metrics.record(Outcome::Requeued),
                        Err(e) => error!(error = %e, "Failed to nack message"),
                    }
                }
                Err(HandlerError::Permanent(reason)) => {
                    error!(reason = %reason, "Permanent failure");
                    let letter = DeadLetter::rejected(&self.queue, &delivery, &event, reason);
                    self.dead_letter(delivery, letter, Outcome::DeadLettered, dead_letter_channel)
                        .await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, event: &ProfileEvent) -> Result<(), HandlerError> {
        let id = event.entity_id();
        match event.action() {
            Action::Create => self.sink.create(id, event.payload()).await?,
            Action::Update => self.sink.update(id, event.payload()).await?,
            Action::Delete => self.sink.delete(id).await?,
        }
        Ok(())
    }

    /// Publish the dead letter, then ack the original. If the dead letter
    /// cannot be published the original is rejected without requeue and
    /// counted as dropped.
    async fn dead_letter(
        &self,
        delivery: Delivery,
        letter: DeadLetter,
        outcome: Outcome,
        channel: Option<&C::Channel>,
    ) {
        let published = match (&self.dead_letters, channel) {
            (Some(dlq), Some(channel)) => match dlq.publish(channel, &letter).await {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        reason = %letter.reason,
                        error = %e,
                        "Dead-letter publish failed, message dropped"
                    );
                    false
                }
            },
            _ => {
                warn!(queue = %self.queue, reason = %letter.reason, "Rejecting message");
                false
            }
        };

        let (settled, outcome) = if published {
            (delivery.ack().await, outcome)
        } else {
            (delivery.reject(false).await, Outcome::Dropped)
        };

        match settled {
            Ok(()) => self.metrics.record(outcome),
            Err(e) => error!(error = %e, "Failed to settle unprocessable message"),
        }
    }
}

/// Handle to a running `ConsumerWorker`.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ConsumeError>>,
    metrics: Arc<ConsumerMetrics>,
}

impl WorkerHandle {
    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop taking deliveries, let in-flight messages finish, then close
    /// the subscription and return the channel to the pool.
    pub async fn shutdown(self) -> Result<(), ConsumeError> {
        let _ = self.shutdown.send(true);
        self.join().await
    }

    /// Run until `signal` completes, then shut down as `shutdown` does.
    /// Returns early if the worker stops by itself.
    pub async fn run_until<F: Future>(mut self, signal: F) -> Result<(), ConsumeError> {
        tokio::select! {
            _ = signal => {
                let _ = self.shutdown.send(true);
            }
            result = &mut self.task => {
                return result.map_err(|e| ConsumeError::Join(e.to_string()))?;
            }
        }
        self.join().await
    }

    /// Wait for the worker to stop on its own.
    pub async fn join(self) -> Result<(), ConsumeError> {
        self.task
            .await
            .map_err(|e| ConsumeError::Join(e.to_string()))?
    }

    /// Kill the worker without settling in-flight messages. Unacked
    /// deliveries go back to the broker.
    pub async fn abort(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::pool::PoolConfig;
    use crate::sink::{InMemoryProfileStore, SinkOp};

    fn worker(
        broker: &MemoryBroker,
        sink: Arc<InMemoryProfileStore>,
        config: WorkerConfig,
    ) -> ConsumerWorker<MemoryBroker, InMemoryProfileStore> {
        let pool = ChannelPool::new(broker.clone(), &PoolConfig::default()).unwrap();
        ConsumerWorker::new(pool, TopologyManager::default(), sink, config)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_sink_errors_classified() {
        assert!(matches!(
            HandlerError::from(SinkError::Storage("down".into())),
            HandlerError::Transient(_)
        ));
        assert!(matches!(
            HandlerError::from(SinkError::Validation("bad".into())),
            HandlerError::Permanent(_)
        ));
        assert!(matches!(
            HandlerError::from(SinkError::NotFound(1)),
            HandlerError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_entity_order_chains_same_user_only() {
        let mut order = EntityOrder::default();

        let mut first = order.next_turn(1);
        let mut second = order.next_turn(1);
        let mut other = order.next_turn(2);

        first.wait().await;
        other.wait().await;

        let waiting = tokio::spawn(async move {
            second.wait().await;
            second
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(first);
        let second = waiting.await.unwrap();
        assert_eq!(order.len(), 2);

        drop(second);
        drop(other);
        order.prune();
        assert_eq!(order.len(), 0);
    }

    #[tokio::test]
    async fn test_pool_too_small_for_dead_letters_stops_worker() {
        let broker = MemoryBroker::new();
        let pool = ChannelPool::new(
            broker.clone(),
            &PoolConfig {
                max_size: 1,
                wait_timeout_ms: 100,
            },
        )
        .unwrap();
        let sink = Arc::new(InMemoryProfileStore::new());
        let handle =
            ConsumerWorker::new(pool, TopologyManager::default(), sink, WorkerConfig::default())
                .spawn();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("worker kept running");
        assert!(matches!(result, Err(ConsumeError::Config(_))));
        assert!(ConsumeError::Config(String::new()).is_fatal());
    }

    #[test]
    fn test_queue_follows_entity_id() {
        let broker = MemoryBroker::new();
        let sink = Arc::new(InMemoryProfileStore::new());

        let shared = worker(&broker, Arc::clone(&sink), WorkerConfig::default());
        let entity = worker(
            &broker,
            sink,
            WorkerConfig {
                entity_id: Some(9),
                ..Default::default()
            },
        );

        assert_eq!(shared.queue(), "user_messages");
        assert_eq!(entity.queue(), "user:9");
    }

    #[tokio::test]
    async fn test_consumes_delete_and_acks() {
        let broker = MemoryBroker::new();
        let sink = Arc::new(InMemoryProfileStore::new());
        let handle = worker(&broker, Arc::clone(&sink), WorkerConfig::default()).spawn();

        let channel = broker.open_channel().await.unwrap();
        TopologyManager::default().ensure(&channel, None).await.unwrap();
        let body = codec::encode(&ProfileEvent::delete(42)).unwrap();
        channel.publish("user_form", "user_messages", &body).await.unwrap();

        let metrics = Arc::clone(handle.metrics());
        wait_for(|| metrics.acked() == 1).await;

        assert_eq!(sink.operations().await, vec![SinkOp::Delete(42)]);
        assert_eq!(broker.unacked_count("user_messages"), 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_without_dead_letter_queue() {
        let broker = MemoryBroker::new();
        let sink = Arc::new(InMemoryProfileStore::new());
        let handle = worker(
            &broker,
            sink,
            WorkerConfig {
                dead_letter: false,
                ..Default::default()
            },
        )
        .spawn();

        let channel = broker.open_channel().await.unwrap();
        TopologyManager::default().ensure(&channel, None).await.unwrap();
        channel
            .publish("user_form", "user_messages", b"not msgpack")
            .await
            .unwrap();

        let metrics = Arc::clone(handle.metrics());
        wait_for(|| metrics.dropped() == 1).await;

        assert_eq!(metrics.poison(), 0);
        assert_eq!(broker.discarded_count(), 1);
        assert!(!broker.queue_names().contains(&"user_form.dlq".to_string()));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_topology_mismatch_stops_worker() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_queue(&crate::broker::QueueSpec {
                name: "user_messages".to_string(),
                durable: false,
            })
            .await
            .unwrap();

        let sink = Arc::new(InMemoryProfileStore::new());
        let handle = worker(&broker, sink, WorkerConfig::default()).spawn();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("worker kept running");
        assert!(matches!(
            result,
            Err(ConsumeError::Topology(TopologyError::Mismatch { .. }))
        ));
    }
}
