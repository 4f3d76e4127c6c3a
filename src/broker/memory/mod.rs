//! In-memory broker for standalone mode and tests.
//!
//! Models the parts of AMQP the bus relies on: durable declarations with
//! conflict detection, exchange-to-queue bindings with topic matching,
//! mandatory publish, per-consumer unacknowledged tracking and redelivery of
//! unsettled messages when a consumer or connection goes away.
//!
//! Prefetch is not enforced here; the consumer worker bounds its own
//! in-flight work.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{
    Acker, BrokerChannel, BrokerError, Connector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, QueueSpec, Result, Routed,
};

/// A queue bound to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Queue {
    spec: QueueSpec,
    messages: VecDeque<Message>,
    notify: Arc<Notify>,
}

struct Unacked {
    queue: String,
    session: u64,
    message: Message,
}

struct State {
    available: bool,
    /// Connection generation. Channels opened under an older epoch are dead.
    epoch: u64,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    unacked: BTreeMap<u64, Unacked>,
    next_tag: u64,
    next_session: u64,
    channels_opened: u64,
    discarded: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            available: true,
            epoch: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            unacked: BTreeMap::new(),
            next_tag: 1,
            next_session: 1,
            channels_opened: 0,
            discarded: 0,
        }
    }
}

impl State {
    /// Put unsettled messages matching `filter` back at the head of their
    /// queues, preserving delivery order.
    fn requeue_where(&mut self, filter: impl Fn(&Unacked) -> bool) -> usize {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| filter(u))
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.iter().rev() {
            if let Some(unacked) = self.unacked.remove(tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(Message {
                        redelivered: true,
                        ..unacked.message
                    });
                    queue.notify.notify_one();
                }
            }
        }
        tags.len()
    }

    fn wake_all(&self) {
        for queue in self.queues.values() {
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        }
    }
}

/// Check if a routing key matches a topic binding pattern.
///
/// Words are dot separated. `*` matches exactly one word, `#` matches zero or
/// more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            words_match(rest, key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => words_match(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && words_match(rest, key_rest)
        }
        _ => false,
    }
}

fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the broker down or bring it back.
    ///
    /// Going down closes every open channel and returns all unacknowledged
    /// messages to their queues, as a broker does when connections drop.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        if state.available && !available {
            state.epoch += 1;
            let requeued = state.requeue_where(|_| true);
            state.wake_all();
            info!(requeued = requeued, "Memory broker went down");
        } else if !state.available && available {
            info!("Memory broker back up");
        }
        state.available = available;
    }

    /// Drop every open connection while staying available.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        let requeued = state.requeue_where(|_| true);
        state.wake_all();
        info!(requeued = requeued, "Memory broker dropped connections");
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    /// Declared queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.lock().bindings.clone()
    }

    /// Messages ready for delivery on a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Messages delivered from a queue and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Bodies of the ready messages on a queue, head first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages settled without requeue.
    pub fn discarded_count(&self) -> u64 {
        self.lock().discarded
    }

    /// Channels opened since the broker was created.
    pub fn channels_opened(&self) -> u64 {
        self.lock().channels_opened
    }

    fn open(&self) -> Result<MemoryChannel> {
        let mut state = self.lock();
        if !state.available {
            return Err(BrokerError::Connection("memory broker unavailable".to_string()));
        }
        state.channels_opened += 1;
        Ok(MemoryChannel {
            broker: self.clone(),
            epoch: state.epoch,
            closed: AtomicBool::new(false),
        })
    }

    fn settle(&self, tag: u64, outcome: Settle) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let unacked = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {}", tag)))?;

        match outcome {
            Settle::Ack => {}
            Settle::Discard => state.discarded += 1,
            Settle::Requeue => {
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(Message {
                        redelivered: true,
                        ..unacked.message
                    });
                    queue.notify.notify_one();
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        self.open()
    }
}

/// Channel on a `MemoryBroker`.
pub struct MemoryChannel {
    broker: MemoryBroker,
    epoch: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn check_open(&self, state: &State) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !state.available || state.epoch != self.epoch {
            return Err(BrokerError::Connection("channel closed".to_string()));
        }
        Ok(())
    }

    /// Channel-level errors close the channel, as in AMQP.
    fn fail(&self, err: BrokerError) -> BrokerError {
        self.closed.store(true, Ordering::SeqCst);
        err
    }

    fn declare_exchange_sync(&self, exchange: &ExchangeSpec) -> Result<()> {
        let mut state = self.broker.lock();
        self.check_open(&state)?;

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing == exchange => Ok(()),
            Some(existing) => Err(self.fail(BrokerError::PreconditionFailed(format!(
                "exchange '{}' exists as {:?} (durable={}), requested {:?} (durable={})",
                exchange.name, existing.kind, existing.durable, exchange.kind, exchange.durable
            )))),
            None => {
                debug!(exchange = %exchange.name, kind = ?exchange.kind, "Declared exchange");
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    fn declare_queue_sync(&self, queue: &QueueSpec) -> Result<()> {
        let mut state = self.broker.lock();
        self.check_open(&state)?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec == *queue => Ok(()),
            Some(existing) => Err(self.fail(BrokerError::PreconditionFailed(format!(
                "queue '{}' exists with durable={}, requested durable={}",
                queue.name, existing.spec.durable, queue.durable
            )))),
            None => {
                debug!(queue = %queue.name, "Declared queue");
                state.queues.insert(
                    queue.name.clone(),
                    Queue {
                        spec: queue.clone(),
                        messages: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    fn bind_queue_sync(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        self.check_open(&state)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(self.fail(BrokerError::NotFound(format!("exchange '{}'", exchange))));
        }
        if !state.queues.contains_key(queue) {
            return Err(self.fail(BrokerError::NotFound(format!("queue '{}'", queue))));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Bound queue");
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn publish_sync(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<Routed> {
        let mut guard = self.broker.lock();
        let state = &mut *guard;
        self.check_open(state)?;

        let kind = match state.exchanges.get(exchange) {
            Some(spec) => spec.kind,
            None => {
                return Err(self.fail(BrokerError::NotFound(format!("exchange '{}'", exchange))))
            }
        };

        let mut targets: Vec<&str> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
            if binding_matches(kind, &binding.routing_key, routing_key)
                && !targets.contains(&binding.queue.as_str())
            {
                targets.push(binding.queue.as_str());
            }
        }

        if targets.is_empty() {
            return Ok(Routed::Unroutable);
        }

        for name in targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.messages.push_back(Message {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
                queue.notify.notify_one();
            }
        }
        Ok(Routed::Delivered)
    }

    fn start_session(&self, queue: &str) -> Result<Arc<Session>> {
        let mut state = self.broker.lock();
        self.check_open(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(self.fail(BrokerError::NotFound(format!("queue '{}'", queue))));
        }

        let id = state.next_session;
        state.next_session += 1;

        Ok(Arc::new(Session {
            broker: self.broker.clone(),
            id,
            queue: queue.to_string(),
            epoch: self.epoch,
        }))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.declare_exchange_sync(exchange)
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.declare_queue_sync(queue)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.bind_queue_sync(queue, exchange, routing_key)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<Routed> {
        self.publish_sync(exchange, routing_key, body)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream> {
        let session = self.start_session(queue)?;
        debug!(queue = %queue, consumer_tag = %consumer_tag, session = session.id, "Consumer started");

        let stream = futures::stream::unfold(session, |session| async move {
            loop {
                match session.try_next() {
                    Next::Ready(delivery) => return Some((Ok(delivery), session)),
                    Next::Closed => return None,
                    Next::Wait(notify) => notify.notified().await,
                }
            }
        });

        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        let state = self.broker.lock();
        self.check_open(&state).is_ok()
    }
}

enum Next {
    Ready(Delivery),
    Closed,
    Wait(Arc<Notify>),
}

/// One consumer subscription. Dropping it returns its unsettled messages to
/// the queue.
struct Session {
    broker: MemoryBroker,
    id: u64,
    queue: String,
    epoch: u64,
}

impl Session {
    fn try_next(&self) -> Next {
        let mut guard = self.broker.lock();
        let state = &mut *guard;

        if !state.available || state.epoch != self.epoch {
            return Next::Closed;
        }

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Next::Closed;
        };

        let Some(message) = queue.messages.pop_front() else {
            return Next::Wait(Arc::clone(&queue.notify));
        };

        let tag = state.next_tag;
        state.next_tag += 1;

        let delivery = Delivery::new(
            message.body.clone(),
            message.routing_key.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                broker: self.broker.clone(),
                tag,
            }),
        );

        state.unacked.insert(
            tag,
            Unacked {
                queue: self.queue.clone(),
                session: self.id,
                message,
            },
        );

        Next::Ready(delivery)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut state = self.broker.lock();
        let id = self.id;
        let requeued = state.requeue_where(|u| u.session == id);
        if requeued > 0 {
            debug!(queue = %self.queue, requeued = requeued, "Consumer closed with unacked messages");
        }
    }
}

enum Settle {
    Ack,
    Requeue,
    Discard,
}

impl Settle {
    fn negative(requeue: bool) -> Self {
        if requeue {
            Settle::Requeue
        } else {
            Settle::Discard
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(self.tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.broker.settle(self.tag, Settle::negative(requeue))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.broker.settle(self.tag, Settle::negative(requeue))
    }
}

#[cfg(test)]
mod tests;
