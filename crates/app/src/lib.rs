//! `castline-app` — runtime wiring shared by the castline binaries.
//!
//! `AppContext` owns the broker topology, the publisher and every consumer
//! started through it. Binaries build one at startup and call `shutdown`
//! when a termination signal arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use tokio::task::JoinHandle;
use tracing::info;

use castline_events::BrokerConnector;
use castline_infra::blob::LocalBlobStore;
use castline_infra::broker::{Consumer, ConsumerOptions, Publisher, TopologyManager};
use castline_infra::config::{TopologyConfig, WorkerConfig};
use castline_infra::jobs::{JobStore, Orchestrator, StatusApplier};
use castline_infra::pipelines::{
    AssetCache, ExclusiveResource, JobDescriptor, JobRegistry, ModelAsset, PipelineWorker, ProcessTransform,
    RecastDescriptor,
};

pub struct AppContext<K: BrokerConnector> {
    topology: Arc<TopologyManager<K>>,
    publisher: Publisher<K>,
    consumers: Mutex<Vec<Consumer<K>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<K: BrokerConnector> AppContext<K> {
    /// Connect and declare the topology. Retries until the broker is reachable,
    /// then keeps the link up until `shutdown`.
    pub async fn init(connector: K, config: TopologyConfig) -> anyhow::Result<Self> {
        let topology = Arc::new(TopologyManager::new(connector, config));
        topology.start().await;
        topology
            .channel()
            .context("broker channel missing after topology start")?;
        info!(exchange = %topology.config().exchange, "topology ready");

        Ok(Self {
            publisher: Publisher::new(topology.clone()),
            supervisor: Mutex::new(Some(topology.supervise())),
            topology,
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn topology(&self) -> &Arc<TopologyManager<K>> {
        &self.topology
    }

    pub fn publisher(&self) -> &Publisher<K> {
        &self.publisher
    }

    pub fn orchestrator<S: JobStore>(&self, store: S, max_jobs_per_request: usize) -> Orchestrator<K, S> {
        Orchestrator::new(store, self.publisher.clone(), max_jobs_per_request)
    }

    pub fn consumer_options(&self, concurrency: usize, drain_timeout: Duration, tag: &str) -> ConsumerOptions {
        ConsumerOptions {
            concurrency,
            retry_backoff: self.topology.config().retry_backoff,
            drain_timeout,
            consumer_tag: tag.to_string(),
        }
    }

    /// Warm up every job type, then consume the submit queue.
    pub async fn start_worker(&self, registry: JobRegistry, options: ConsumerOptions) -> anyhow::Result<()> {
        registry.warmup().await.context("job type warmup failed")?;

        let worker = PipelineWorker::new(Arc::new(registry), self.publisher.clone(), ExclusiveResource::new())
            .with_retry_max(self.topology.config().retry_max);
        let queue = self.topology.config().submit_queue.clone();
        self.spawn_consumer(&queue, worker, options)
    }

    /// Consume the update queue, applying status changes to `store`.
    pub fn start_status_applier<S: JobStore + 'static>(&self, store: S, options: ConsumerOptions) -> anyhow::Result<()> {
        let queue = self.topology.config().update_queue.clone();
        self.spawn_consumer(&queue, StatusApplier::new(store), options)
    }

    fn spawn_consumer<H>(&self, queue: &str, handler: H, options: ConsumerOptions) -> anyhow::Result<()>
    where
        H: castline_infra::broker::MessageHandler,
    {
        let consumer = Consumer::new(self.topology.clone(), options);
        consumer
            .consume(queue, handler)
            .with_context(|| format!("failed to consume {queue}"))?;
        info!(queue, "consumer started");
        self.consumers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(consumer);
        Ok(())
    }

    /// Stop consumers (draining in-flight work), then close the broker channel.
    pub async fn shutdown(&self) {
        let consumers = std::mem::take(&mut *self.consumers.lock().unwrap_or_else(|p| p.into_inner()));
        for consumer in consumers.iter().rev() {
            consumer.stop().await;
        }
        self.topology.close().await;
        let supervisor = self.supervisor.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "topology supervisor ended abnormally");
            }
        }
        info!(stopped = consumers.len(), "shutdown complete");
    }
}

/// Registry with the `recast` job type backed by the local blob store and
/// the configured external transform.
pub fn recast_registry(config: &WorkerConfig) -> anyhow::Result<JobRegistry> {
    let transform = ProcessTransform::from_command_line(&config.transform_command, config.scratch_dir.clone())
        .context("TRANSFORM_COMMAND is empty")?;
    let descriptor = RecastDescriptor::new(
        Arc::new(LocalBlobStore::new(config.blob_root.clone(), config.blob_public_url.clone())),
        Arc::new(AssetCache::new(config.cache_max_bytes)),
        Arc::new(transform),
    )
    .with_model(ModelAsset {
        bucket: config.model_bucket.clone(),
        key: config.model_key.clone(),
        dir: config.model_dir.clone(),
    });

    let mut registry = JobRegistry::new();
    registry.register(JobDescriptor::Recast(descriptor));
    Ok(registry)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "shutdown requested"),
        _ = terminate => info!(signal = "SIGTERM", "shutdown requested"),
    }
}
