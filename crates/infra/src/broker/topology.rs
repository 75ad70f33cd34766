//! Broker connection lifecycle and topology declaration.
//!
//! Transport failures while connecting or declaring are never fatal: the
//! manager logs and retries after `reconnect_delay`, indefinitely. Only
//! passive queue inspection surfaces errors to the caller.
//!
//! `supervise` keeps the link up for every user of the manager, including
//! processes that only publish.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use castline_events::{BrokerChannel, BrokerConnector, BrokerError, QueueSpec};

use crate::config::TopologyConfig;

/// Owns the (single) broker channel of a process.
pub struct TopologyManager<K: BrokerConnector> {
    connector: K,
    config: TopologyConfig,
    channel: RwLock<Option<Arc<K::Channel>>>,
    reconnecting: Mutex<()>,
    closed: CancellationToken,
}

impl<K: BrokerConnector> TopologyManager<K> {
    pub fn new(connector: K, config: TopologyConfig) -> Self {
        Self {
            connector,
            config,
            channel: RwLock::new(None),
            reconnecting: Mutex::new(()),
            closed: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// The current channel, if one is open.
    pub fn channel(&self) -> Result<Arc<K::Channel>, BrokerError> {
        self.channel
            .read()
            .map_err(|_| BrokerError::NotConnected)?
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn set_channel(&self, channel: Option<Arc<K::Channel>>) -> Option<Arc<K::Channel>> {
        match self.channel.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, channel),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), channel),
        }
    }

    /// Connect and open a channel with the configured prefetch.
    ///
    /// Retries forever; returns once a channel is open.
    pub async fn connect(&self) -> Arc<K::Channel> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.connector.connect(self.config.prefetch).await {
                Ok(channel) => {
                    let channel = Arc::new(channel);
                    self.set_channel(Some(channel.clone()));
                    info!(attempt, prefetch = self.config.prefetch, "broker connected");
                    return channel;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                        "broker connection failed"
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// Declare exchanges, queues and bindings (idempotent).
    ///
    /// Retries forever, reconnecting first when the channel is gone.
    pub async fn declare_topology(&self) {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let channel = match self.channel() {
                Ok(channel) if channel.is_open() => channel,
                _ => self.connect().await,
            };

            match declare(channel.as_ref(), &self.config).await {
                Ok(()) => {
                    info!(
                        exchange = %self.config.exchange,
                        dlx = %self.config.dead_letter_exchange,
                        "broker topology declared"
                    );
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "topology declaration failed");
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// `connect` followed by `declare_topology`.
    pub async fn start(&self) -> Arc<K::Channel> {
        self.connect().await;
        self.declare_topology().await;
        // declare_topology may have reconnected
        match self.channel() {
            Ok(channel) => channel,
            Err(_) => self.connect().await,
        }
    }

    /// Replace a dead channel.
    ///
    /// Concurrent callers holding the same stale channel share one
    /// reconnection; later callers get the channel it produced.
    pub async fn reconnect(&self, stale: &Arc<K::Channel>) -> Arc<K::Channel> {
        let _guard = self.reconnecting.lock().await;

        if let Ok(current) = self.channel() {
            if !Arc::ptr_eq(&current, stale) && current.is_open() {
                debug!("channel already replaced");
                return current;
            }
        }

        if let Err(e) = stale.close().await {
            debug!(error = %e, "closing stale channel");
        }
        self.set_channel(None);

        warn!("reconnecting to broker");
        self.connect().await;
        self.declare_topology().await;
        match self.channel() {
            Ok(channel) => channel,
            Err(_) => self.connect().await,
        }
    }

    /// Check the channel every `reconnect_delay` and replace it once it is
    /// no longer open. Runs until `close` or until the manager is dropped.
    pub fn supervise(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let closed = self.closed.clone();
        let interval = self.config.reconnect_delay;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let stale = match manager.channel() {
                    Ok(channel) if !channel.is_open() => channel,
                    _ => continue,
                };
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = manager.reconnect(&stale) => {}
                }
            }
            debug!("topology supervisor stopped");
        })
    }

    /// Ready-message count of a queue (passive declare). Not retried.
    pub async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError> {
        self.channel()?.queue_depth(queue).await
    }

    /// Close channel and connection. Idempotent; errors are swallowed.
    pub async fn close(&self) {
        self.closed.cancel();
        if let Some(channel) = self.set_channel(None) {
            match channel.close().await {
                Ok(()) => info!("broker connection closed"),
                Err(e) => debug!(error = %e, "broker connection already closed"),
            }
        }
    }
}

async fn declare<C: BrokerChannel + ?Sized>(channel: &C, config: &TopologyConfig) -> Result<(), BrokerError> {
    channel.declare_exchange(&config.dead_letter_exchange).await?;
    channel.declare_exchange(&config.exchange).await?;

    let lanes = [
        (&config.submit_queue, &config.submit_dlq, &config.submit_routing_key),
        (&config.update_queue, &config.update_dlq, &config.update_routing_key),
    ];

    for (queue, dlq, routing_key) in lanes {
        channel.declare_queue(&QueueSpec::durable(dlq.as_str())).await?;
        channel
            .bind_queue(dlq, &config.dead_letter_exchange, routing_key)
            .await?;

        let spec = QueueSpec::durable(queue.as_str())
            .with_dead_letter(config.dead_letter_exchange.as_str(), routing_key.as_str());
        channel.declare_queue(&spec).await?;
        channel.bind_queue(queue, &config.exchange, routing_key).await?;
    }

    Ok(())
}
