//! Queue consumer with bounded, supervised handler concurrency.
//!
//! Per delivery:
//!
//! 1. decode; undecodable messages are rejected without requeue (they end
//!    up in the queue's dead-letter queue) and never reach the handler
//! 2. take one semaphore slot, then run the handler on the task tracker
//! 3. settle: success → ack, [`HandlerError::Requeue`] → pause, nack with
//!    requeue, [`HandlerError::DeadLetter`] → reject without requeue
//!
//! `stop` cancels the subscription and waits (up to the drain deadline) for
//! the tracked handlers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use castline_events::{decode, BrokerChannel, BrokerConnector, Delivery, QueueMessage};

use super::topology::TopologyManager;

/// How a failed handler wants its delivery settled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient; the message goes back to the queue.
    #[error("{0}")]
    Requeue(String),

    /// Permanent; the message goes to the dead-letter queue.
    #[error("{0}")]
    DeadLetter(String),
}

/// Processes one decoded message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: QueueMessage;

    async fn handle(&self, message: Self::Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Arc<H> {
    type Message = H::Message;

    async fn handle(&self, message: Self::Message) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    #[error("consumer cannot start from state {0:?}")]
    InvalidState(ConsumerState),
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Handler invocations allowed in flight at once.
    pub concurrency: usize,
    /// Pause before a failed delivery is requeued.
    pub retry_backoff: Duration,
    /// Upper bound on how long `stop` waits for in-flight handlers.
    pub drain_timeout: Duration,
    pub consumer_tag: String,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 50,
            retry_backoff: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(30),
            consumer_tag: "castline".to_string(),
        }
    }
}

/// Consumes one queue with one handler.
pub struct Consumer<K: BrokerConnector> {
    topology: Arc<TopologyManager<K>>,
    options: ConsumerOptions,
    state: Mutex<ConsumerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<K: BrokerConnector> Consumer<K> {
    pub fn new(topology: Arc<TopologyManager<K>>, options: ConsumerOptions) -> Self {
        Self {
            topology,
            options,
            state: Mutex::new(ConsumerState::Idle),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Handler tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Start consuming `queue` in the background.
    pub fn consume<H: MessageHandler>(&self, queue: &str, handler: H) -> Result<(), ConsumerError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != ConsumerState::Idle {
                return Err(ConsumerError::InvalidState(*state));
            }
            *state = ConsumerState::Consuming;
        }

        let dispatch = Dispatch {
            topology: self.topology.clone(),
            queue: queue.to_string(),
            handler: Arc::new(handler),
            semaphore: Arc::new(Semaphore::new(self.options.concurrency.max(1))),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
            options: self.options.clone(),
        };

        info!(queue, concurrency = self.options.concurrency, "consumer started");
        let handle = tokio::spawn(dispatch.run());
        *self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    /// Cancel the subscription and drain in-flight handlers.
    ///
    /// Handlers still running after `drain_timeout` are abandoned; their
    /// deliveries are returned by the broker once the channel closes.
    pub async fn stop(&self) {
        if matches!(self.state(), ConsumerState::Stopping | ConsumerState::Stopped) {
            return;
        }
        self.set_state(ConsumerState::Stopping);
        self.cancel.cancel();

        let handle = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "consumer dispatch loop ended abnormally");
            }
        }

        self.tracker.close();
        let pending = self.tracker.len();
        if tokio::time::timeout(self.options.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                abandoned = self.tracker.len(),
                drain_timeout_ms = self.options.drain_timeout.as_millis() as u64,
                "drain deadline reached"
            );
        } else {
            debug!(drained = pending, "in-flight handlers finished");
        }

        self.set_state(ConsumerState::Stopped);
        info!("consumer stopped");
    }
}

struct Dispatch<K: BrokerConnector, H> {
    topology: Arc<TopologyManager<K>>,
    queue: String,
    handler: Arc<H>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    options: ConsumerOptions,
}

impl<K: BrokerConnector, H: MessageHandler> Dispatch<K, H> {
    async fn run(self) {
        let mut channel = match self.topology.channel() {
            Ok(channel) => channel,
            Err(_) => tokio::select! {
                _ = self.cancel.cancelled() => return,
                channel = self.topology.start() => channel,
            },
        };

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let tag = self.options.consumer_tag.clone();
            let mut stream = match channel.consume(&self.queue, &tag).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "subscribe failed");
                    channel = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        fresh = self.topology.reconnect(&channel) => fresh,
                    };
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        if !self.dispatch(delivery).await {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(queue = %self.queue, error = %e, "delivery stream error");
                        break;
                    }
                    None => break,
                }
            }

            if self.cancel.is_cancelled() {
                return;
            }
            warn!(queue = %self.queue, "subscription ended unexpectedly, resubscribing");
            channel = tokio::select! {
                _ = self.cancel.cancelled() => return,
                fresh = self.topology.reconnect(&channel) => fresh,
            };
        }
    }

    /// Returns false once cancelled.
    async fn dispatch(&self, delivery: Delivery) -> bool {
        let message: H::Message = match decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "undecodable message, dead-lettering"
                );
                if let Err(e) = delivery.reject(false).await {
                    warn!(error = %e, "reject failed");
                }
                return true;
            }
        };

        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let span = info_span!(
            "handle_message",
            queue = %self.queue,
            trace_id = %message.trace_id(),
            job_id = %message.job_id(),
            redelivered = delivery.redelivered,
        );
        let handler = self.handler.clone();
        let backoff = self.options.retry_backoff;

        self.tracker.spawn(
            async move {
                let _permit = permit;
                let outcome = handler.handle(message).await;
                settle(delivery, outcome, backoff).await;
            }
            .instrument(span),
        );
        true
    }
}

async fn settle(delivery: Delivery, outcome: Result<(), HandlerError>, backoff: Duration) {
    let result = match outcome {
        Ok(()) => delivery.ack().await,
        Err(HandlerError::Requeue(reason)) => {
            warn!(error = %reason, "handler failed, requeueing");
            tokio::time::sleep(backoff).await;
            delivery.nack(true).await
        }
        Err(HandlerError::DeadLetter(reason)) => {
            error!(error = %reason, "handler gave up, dead-lettering");
            delivery.reject(false).await
        }
    };

    if let Err(e) = result {
        warn!(error = %e, "failed to settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use castline_core::{JobId, TraceId};
    use castline_events::{encode, InMemoryBroker, OutgoingMessage, UpdateMessage};
    use tokio::sync::Notify;

    use crate::test_support::{fast_config, wait_until};

    const QUEUE: &str = "pipelines.update";

    struct Recording {
        seen: Arc<Mutex<Vec<JobId>>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        type Message = UpdateMessage;

        async fn handle(&self, message: UpdateMessage) -> Result<(), HandlerError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(HandlerError::Requeue("not yet".to_string()));
            }
            self.seen.lock().unwrap().push(message.job_id);
            Ok(())
        }
    }

    /// Holds every message until `release` is notified.
    struct Gated {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl MessageHandler for Gated {
        type Message = UpdateMessage;

        async fn handle(&self, _message: UpdateMessage) -> Result<(), HandlerError> {
            self.release.notified().await;
            Ok(())
        }
    }

    async fn setup() -> (InMemoryBroker, Arc<TopologyManager<InMemoryBroker>>) {
        let broker = InMemoryBroker::new();
        let topology = Arc::new(TopologyManager::new(broker.clone(), fast_config()));
        topology.start().await;
        (broker, topology)
    }

    async fn raw_publish(topology: &TopologyManager<InMemoryBroker>, body: Vec<u8>) {
        topology
            .channel()
            .unwrap()
            .publish(
                "pipelines.exchange",
                "pipelines.update",
                OutgoingMessage {
                    body,
                    content_type: "application/json".to_string(),
                    persistent: true,
                },
            )
            .await
            .unwrap();
    }

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            concurrency: 4,
            retry_backoff: Duration::from_millis(1),
            drain_timeout: Duration::from_secs(2),
            consumer_tag: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn acks_handled_messages() {
        let (broker, topology) = setup().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = Consumer::new(topology.clone(), options());
        consumer
            .consume(
                QUEUE,
                Recording {
                    seen: seen.clone(),
                    fail_first: AtomicUsize::new(0),
                },
            )
            .unwrap();

        let job = JobId::new();
        raw_publish(&topology, encode(&UpdateMessage::running(TraceId::new(), job)).unwrap()).await;

        wait_until(|| broker.stats().acked == 1).await;
        assert_eq!(*seen.lock().unwrap(), vec![job]);
        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn failed_handler_is_retried_until_success() {
        let (broker, topology) = setup().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = Consumer::new(topology.clone(), options());
        consumer
            .consume(
                QUEUE,
                Recording {
                    seen: seen.clone(),
                    fail_first: AtomicUsize::new(2),
                },
            )
            .unwrap();

        raw_publish(&topology, encode(&UpdateMessage::running(TraceId::new(), JobId::new())).unwrap()).await;

        wait_until(|| broker.stats().acked == 1).await;
        assert_eq!(broker.stats().requeued, 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn undecodable_message_is_dead_lettered_without_handler() {
        let (broker, topology) = setup().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = Consumer::new(topology.clone(), options());
        consumer
            .consume(
                QUEUE,
                Recording {
                    seen: seen.clone(),
                    fail_first: AtomicUsize::new(0),
                },
            )
            .unwrap();

        raw_publish(&topology, b"{definitely not json".to_vec()).await;

        wait_until(|| broker.ready_count("pipelines.update.dlq") == Some(1)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(broker.stats().acked, 0);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn consuming_twice_is_rejected() {
        let (_broker, topology) = setup().await;
        let consumer = Consumer::new(topology, options());
        let handler = || Recording {
            seen: Arc::new(Mutex::new(Vec::new())),
            fail_first: AtomicUsize::new(0),
        };
        consumer.consume(QUEUE, handler()).unwrap();
        assert_eq!(
            consumer.consume(QUEUE, handler()),
            Err(ConsumerError::InvalidState(ConsumerState::Consuming))
        );
        consumer.stop().await;
        consumer.stop().await;
    }

    #[tokio::test]
    async fn resubscribes_after_channel_loss() {
        let (broker, topology) = setup().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = Consumer::new(topology.clone(), options());
        consumer
            .consume(
                QUEUE,
                Recording {
                    seen: seen.clone(),
                    fail_first: AtomicUsize::new(0),
                },
            )
            .unwrap();

        // let the dispatcher subscribe before cutting the link
        tokio::time::sleep(Duration::from_millis(20)).await;
        topology.channel().unwrap().sever();
        wait_until(|| broker.stats().connections == 2).await;
        wait_until(|| topology.channel().map(|c| c.is_open()).unwrap_or(false)).await;

        raw_publish(&topology, encode(&UpdateMessage::running(TraceId::new(), JobId::new())).unwrap()).await;
        wait_until(|| broker.stats().acked == 1).await;
        consumer.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_handler_and_acks() {
        let (broker, topology) = setup().await;
        let release = Arc::new(Notify::new());
        let consumer = Arc::new(Consumer::new(topology.clone(), options()));
        consumer.consume(QUEUE, Gated { release: release.clone() }).unwrap();

        raw_publish(&topology, encode(&UpdateMessage::running(TraceId::new(), JobId::new())).unwrap()).await;
        wait_until(|| consumer.in_flight() == 1).await;

        let stopping = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!stopping.is_finished());
        assert_eq!(consumer.state(), ConsumerState::Stopping);
        assert_eq!(broker.stats().acked, 0);

        release.notify_one();
        stopping.await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(broker.ready_count(QUEUE), Some(0));
    }

    #[tokio::test]
    async fn stop_abandons_stuck_handler_at_drain_deadline() {
        let (broker, topology) = setup().await;
        let consumer = Consumer::new(
            topology.clone(),
            ConsumerOptions {
                drain_timeout: Duration::from_millis(50),
                ..options()
            },
        );
        consumer
            .consume(
                QUEUE,
                Gated {
                    release: Arc::new(Notify::new()),
                },
            )
            .unwrap();

        raw_publish(&topology, encode(&UpdateMessage::running(TraceId::new(), JobId::new())).unwrap()).await;
        wait_until(|| consumer.in_flight() == 1).await;

        let started = tokio::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(1), consumer.stop())
            .await
            .expect("stop must return at the drain deadline");
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(broker.stats().acked, 0);
        assert_eq!(broker.ready_count(QUEUE), Some(0));

        // closing the channel hands the unacked delivery back
        topology.close().await;
        assert_eq!(broker.ready_count(QUEUE), Some(1));
        assert_eq!(broker.stats().requeued, 1);
    }

    #[tokio::test]
    async fn stop_returns_while_broker_is_unreachable() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let topology = Arc::new(TopologyManager::new(broker.clone(), fast_config()));
        let consumer = Consumer::new(topology, options());
        consumer
            .consume(
                QUEUE,
                Recording {
                    seen: Arc::new(Mutex::new(Vec::new())),
                    fail_first: AtomicUsize::new(0),
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(1), consumer.stop())
            .await
            .expect("stop must not wait for the broker");
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(broker.stats().connections, 0);
    }
}
