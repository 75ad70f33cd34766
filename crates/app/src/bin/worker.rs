//! Compute worker: consumes the submit queue and publishes status updates.

use anyhow::Context as _;

use castline_app::{recast_registry, shutdown_signal, AppContext};
use castline_infra::broker::AmqpConnector;
use castline_infra::config::{TopologyConfig, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    castline_observability::init("castline-worker");

    let topology = TopologyConfig::from_env().context("invalid broker configuration")?;
    let worker = WorkerConfig::from_env().context("invalid worker configuration")?;
    let registry = recast_registry(&worker)?;

    let ctx = AppContext::init(AmqpConnector::new(topology.url.clone()), topology).await?;
    let options = ctx.consumer_options(worker.concurrency, worker.drain_timeout, "castline-worker");
    if let Err(e) = ctx.start_worker(registry, options).await {
        ctx.shutdown().await;
        return Err(e);
    }

    tracing::info!(concurrency = worker.concurrency, "worker running");
    shutdown_signal().await;
    ctx.shutdown().await;
    Ok(())
}
