//! Three-phase job execution around a process-wide exclusive resource.
//!
//! - **prepare**: async, overlaps freely with other jobs (asset fetches)
//! - **execute**: holds the exclusive lock, runs on the blocking pool
//! - **post**: async upload, produces the result reference
//!
//! Any phase failing aborts the job; nothing is published for it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use castline_core::JobId;

use crate::blob::BlobError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("blob storage: {0}")]
    Blob(#[from] BlobError),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("transform panicked: {0}")]
    Panicked(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The scarce resource (GPU) shared by every job of a worker process.
///
/// At most one closure runs under it at any instant; the lock is released
/// when the closure returns, fails or panics.
#[derive(Debug, Clone, Default)]
pub struct ExclusiveResource {
    lock: Arc<Mutex<()>>,
}

/// Time spent waiting for and holding the exclusive resource.
#[derive(Debug, Clone, Copy)]
pub struct LockTiming {
    pub wait: Duration,
    pub held: Duration,
}

impl ExclusiveResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` on the blocking pool while holding the resource.
    pub async fn run_blocking<T, F>(&self, work: F) -> Result<(T, LockTiming), ExecutorError>
    where
        F: FnOnce() -> Result<T, ExecutorError> + Send + 'static,
        T: Send + 'static,
    {
        let waiting = Instant::now();
        let _guard = self.lock.lock().await;
        let wait = waiting.elapsed();

        let held = Instant::now();
        let output = match tokio::task::spawn_blocking(work).await {
            Ok(result) => result?,
            Err(e) => return Err(ExecutorError::Panicked(e.to_string())),
        };

        Ok((
            output,
            LockTiming {
                wait,
                held: held.elapsed(),
            },
        ))
    }
}

/// A job split into its three phases.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Everything the compute phase needs.
    type Inputs: Send + 'static;

    fn job_id(&self) -> JobId;

    async fn prepare(&self) -> Result<Self::Inputs, ExecutorError>;

    /// Blocking compute; called with the exclusive resource held.
    fn execute(&self, inputs: Self::Inputs) -> Result<Vec<u8>, ExecutorError>;

    /// Store the output and return its reference.
    async fn post(&self, output: Vec<u8>) -> Result<String, ExecutorError>;
}

/// Run all three phases, logging per-phase timings.
pub async fn run_pipeline<P: Pipeline>(pipeline: Arc<P>, resource: &ExclusiveResource) -> Result<String, ExecutorError> {
    let job_id = pipeline.job_id();

    let started = Instant::now();
    let inputs = pipeline.prepare().await?;
    let prepare = started.elapsed();

    let compute = pipeline.clone();
    let (output, timing) = resource.run_blocking(move || compute.execute(inputs)).await?;

    let posting = Instant::now();
    let url = pipeline.post(output).await?;
    let post = posting.elapsed();

    info!(
        job_id = %job_id,
        prepare_ms = prepare.as_millis() as u64,
        lock_wait_ms = timing.wait.as_millis() as u64,
        execute_ms = timing.held.as_millis() as u64,
        post_ms = post.as_millis() as u64,
        total_ms = started.elapsed().as_millis() as u64,
        "pipeline finished"
    );
    Ok(url)
}
