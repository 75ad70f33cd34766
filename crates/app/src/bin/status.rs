//! Status applier: consumes the update queue and writes job records.

use std::sync::Arc;

use anyhow::Context as _;

use castline_app::{shutdown_signal, AppContext};
use castline_infra::broker::AmqpConnector;
use castline_infra::config::{ProducerConfig, TopologyConfig};
use castline_infra::jobs::{InMemoryJobStore, PostgresJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    castline_observability::init("castline-status");

    let topology = TopologyConfig::from_env().context("invalid broker configuration")?;
    let producer = ProducerConfig::from_env().context("invalid producer configuration")?;

    let ctx = AppContext::init(AmqpConnector::new(topology.url.clone()), topology).await?;
    let options = ctx.consumer_options(producer.status_concurrency, producer.drain_timeout, "castline-status");

    let started = match producer.database_url.as_deref() {
        Some(url) => {
            let store = PostgresJobStore::connect(url).await.context("database connection failed")?;
            store.migrate().await.context("jobs table migration failed")?;
            ctx.start_status_applier(Arc::new(store), options)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; job records are kept in memory");
            ctx.start_status_applier(InMemoryJobStore::arc(), options)
        }
    };
    if let Err(e) = started {
        ctx.shutdown().await;
        return Err(e);
    }

    tracing::info!(concurrency = producer.status_concurrency, "status applier running");
    shutdown_signal().await;
    ctx.shutdown().await;
    Ok(())
}
