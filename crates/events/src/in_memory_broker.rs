//! In-memory broker for tests/dev.
//!
//! Models the broker behavior the rest of the system depends on:
//!
//! - direct exchanges and routing-key bindings
//! - dead-letter routing on reject/nack without requeue
//! - requeue to the head of the queue with the `redelivered` flag set
//! - per-consumer prefetch (0 = unlimited)
//! - unsettled deliveries returned to their queue when dropped or when
//!   their channel closes
//!
//! Fault injection hooks (`fail_next_connects`, `fail_next_declares`,
//! `nack_next_publishes`, `set_confirm_delay`) let tests drive the retry and
//! error paths of the callers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::broker::{
    Acknowledger, BrokerChannel, BrokerConnector, BrokerError, DeadLetter, Delivery, DeliveryStream,
    OutgoingMessage, QueueSpec,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    content_type: String,
    persistent: bool,
    redelivered: bool,
}

/// Properties a ready message was published with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub persistent: bool,
}

/// A delivered message awaiting settlement, shared by its acker and channel.
type UnsettledSlot = Arc<Mutex<Option<StoredMessage>>>;

#[derive(Debug)]
struct QueueState {
    dead_letter: Option<DeadLetter>,
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    /// (exchange, routing key) -> bound queues
    bindings: HashMap<(String, String), Vec<String>>,
    queues: HashMap<String, QueueState>,
}

/// Counters for assertions in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: u64,
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Rejected without requeue from a queue that has no dead-letter exchange.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Faults {
    connects: AtomicU32,
    declares: AtomicU32,
    publish_nacks: AtomicU32,
    confirm_delay_ms: AtomicU64,
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    stats: Arc<Mutex<BrokerStats>>,
    faults: Arc<Faults>,
    next_tag: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.faults.connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` exchange declarations fail.
    pub fn fail_next_declares(&self, n: u32) {
        self.faults.declares.store(n, Ordering::SeqCst);
    }

    /// The next `n` publishes are negatively confirmed (nothing is routed).
    pub fn nack_next_publishes(&self, n: u32) {
        self.faults.publish_nacks.store(n, Ordering::SeqCst);
    }

    /// Delay every publish confirmation.
    pub fn set_confirm_delay(&self, delay: Duration) {
        self.faults
            .confirm_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BrokerStats {
        lock(&self.stats).clone()
    }

    /// Ready (undelivered) messages in a queue, `None` if it does not exist.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        lock(&self.state).queues.get(queue).map(|q| q.ready.len())
    }

    /// Decoded bodies of the ready messages in a queue (oldest first).
    pub fn peek_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Publish properties of the ready messages in a queue (oldest first).
    pub fn peek_properties(&self, queue: &str) -> Vec<MessageProperties> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| MessageProperties {
                        content_type: m.content_type.clone(),
                        persistent: m.persistent,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn route(&self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<usize, BrokerError> {
        let mut state = lock(&self.state);
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        let targets = state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default();

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_waiters();
            }
        }

        Ok(targets.len())
    }

    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        lock(&self.state)
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
    }

    fn requeue(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        {
            let mut state = lock(&self.state);
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_front(message);
                q.notify.notify_waiters();
            }
        }
        lock(&self.stats).requeued += 1;
    }

    fn dead_letter(&self, queue: &str, message: StoredMessage) {
        let target = lock(&self.state)
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter.clone());

        match target {
            Some(dl) => {
                let message = StoredMessage {
                    redelivered: false,
                    ..message
                };
                // A missing dead-letter exchange drops the message, like the real broker.
                let _ = self.route(&dl.exchange, &dl.routing_key, message);
                lock(&self.stats).dead_lettered += 1;
                tracing::debug!(queue, exchange = %dl.exchange, "message dead-lettered");
            }
            None => {
                lock(&self.stats).dropped += 1;
                tracing::debug!(queue, "rejected message dropped (no dead-letter exchange)");
            }
        }
    }

    fn wake_all(&self) {
        for queue in lock(&self.state).queues.values() {
            queue.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    type Channel = InMemoryChannel;

    async fn connect(&self, prefetch: u16) -> Result<InMemoryChannel, BrokerError> {
        if take_one(&self.faults.connects) {
            return Err(BrokerError::Connection("connection refused (injected)".to_string()));
        }
        lock(&self.stats).connections += 1;

        Ok(InMemoryChannel {
            broker: self.clone(),
            prefetch,
            open: Arc::new(AtomicBool::new(true)),
            unsettled: Arc::default(),
        })
    }
}

/// Channel on an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    prefetch: u16,
    open: Arc<AtomicBool>,
    /// (queue, slot) for every delivery handed out on this channel.
    unsettled: Arc<Mutex<Vec<(String, UnsettledSlot)>>>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Simulate the connection dropping underneath the channel.
    pub fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.return_unsettled();
        self.broker.wake_all();
    }

    /// A closed channel hands its unacknowledged deliveries back to their queues.
    fn return_unsettled(&self) {
        let returned: Vec<(String, StoredMessage)> = lock(&self.unsettled)
            .drain(..)
            .filter_map(|(queue, slot)| {
                let message = lock(&slot).take();
                message.map(|message| (queue, message))
            })
            .collect();
        for (queue, message) in returned {
            self.broker.requeue(&queue, message);
        }
    }
}

struct ConsumeContext {
    broker: InMemoryBroker,
    queue: String,
    notify: Arc<Notify>,
    prefetch: Arc<Semaphore>,
    open: Arc<AtomicBool>,
    unsettled: Arc<Mutex<Vec<(String, UnsettledSlot)>>>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if take_one(&self.broker.faults.declares) {
            return Err(BrokerError::Declare(format!("exchange {name} (injected)")));
        }
        lock(&self.broker.state).exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        lock(&self.broker.state)
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| QueueState {
                dead_letter: spec.dead_letter.clone(),
                ready: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }

        let bound = state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError> {
        self.ensure_open()?;
        lock(&self.broker.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u32)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let delay = self.broker.faults.confirm_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take_one(&self.broker.faults.publish_nacks) {
            return Err(BrokerError::PublishNacked(format!("{exchange}/{routing_key} (injected)")));
        }

        self.broker.route(
            exchange,
            routing_key,
            StoredMessage {
                body: message.body,
                content_type: message.content_type,
                persistent: message.persistent,
                redelivered: false,
            },
        )?;
        lock(&self.broker.stats).published += 1;
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let notify = lock(&self.broker.state)
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let permits = if self.prefetch == 0 {
            Semaphore::MAX_PERMITS
        } else {
            self.prefetch as usize
        };

        let ctx = ConsumeContext {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            notify,
            prefetch: Arc::new(Semaphore::new(permits)),
            open: self.open.clone(),
            unsettled: self.unsettled.clone(),
        };

        let stream = futures::stream::unfold(ctx, |ctx| async move {
            let permit = ctx.prefetch.clone().acquire_owned().await.ok()?;
            let notify = ctx.notify.clone();
            loop {
                let notified = notify.notified();
                if !ctx.open.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(message) = ctx.broker.pop(&ctx.queue) {
                    let tag = ctx.broker.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                    let body = message.body.clone();
                    let redelivered = message.redelivered;
                    let slot: UnsettledSlot = Arc::new(Mutex::new(Some(message)));
                    {
                        let mut unsettled = lock(&ctx.unsettled);
                        unsettled.retain(|(_, slot)| lock(slot).is_some());
                        unsettled.push((ctx.queue.clone(), slot.clone()));
                    }
                    let delivery = Delivery::new(
                        tag,
                        body,
                        redelivered,
                        Box::new(InMemoryAcker {
                            broker: ctx.broker.clone(),
                            queue: ctx.queue.clone(),
                            message: slot,
                            permit: Mutex::new(Some(permit)),
                            open: ctx.open.clone(),
                        }),
                    );
                    return Some((Ok(delivery), ctx));
                }
                notified.await;
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.return_unsettled();
            self.broker.wake_all();
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    message: UnsettledSlot,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    open: Arc<AtomicBool>,
}

impl InMemoryAcker {
    fn settle(&self) -> Result<StoredMessage, BrokerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        let message = lock(&self.message)
            .take()
            .ok_or_else(|| BrokerError::Ack("delivery already settled".to_string()))?;
        lock(&self.permit).take();
        Ok(message)
    }

    fn settle_negative(&self, requeue: bool) -> Result<(), BrokerError> {
        let message = self.settle()?;
        if requeue {
            self.broker.requeue(&self.queue, message);
        } else {
            self.broker.dead_letter(&self.queue, message);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle()?;
        lock(&self.broker.stats).acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle_negative(requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle_negative(requeue)
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        // Unsettled when the consumer went away: the broker gets it back.
        if let Some(message) = lock(&self.message).take() {
            self.broker.requeue(&self.queue, message);
        }
    }
}
