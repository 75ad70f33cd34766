//! Worker-side submit handler.
//!
//! Per message: publish `RUNNING`, resolve the job type, run the three
//! phases, publish `COMPLETED` with the result reference. Any failure
//! requeues the message. With a retry bound configured, the delivery that
//! reaches it publishes `FAILED` and is dead-lettered instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{error, info, warn};

use castline_core::JobId;
use castline_events::{BrokerConnector, SubmitMessage, UpdateMessage};

use crate::broker::{HandlerError, MessageHandler, PublishError, Publisher};

use super::executor::{ExclusiveResource, ExecutorError};
use super::registry::{JobRegistry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("status publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub struct PipelineWorker<K: BrokerConnector> {
    registry: Arc<JobRegistry>,
    publisher: Publisher<K>,
    resource: ExclusiveResource,
    retry_max: Option<u32>,
    failures: Mutex<HashMap<JobId, u32>>,
}

impl<K: BrokerConnector> PipelineWorker<K> {
    pub fn new(registry: Arc<JobRegistry>, publisher: Publisher<K>, resource: ExclusiveResource) -> Self {
        Self {
            registry,
            publisher,
            resource,
            retry_max: None,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Dead-letter a job after this many failed deliveries.
    pub fn with_retry_max(mut self, retry_max: Option<u32>) -> Self {
        self.retry_max = retry_max;
        self
    }

    async fn process(&self, message: &SubmitMessage) -> Result<String, WorkerError> {
        self.publisher
            .publish_update(&UpdateMessage::running(message.trace_id, message.job_id))
            .await?;

        let executor = self
            .registry
            .create_executor(message.job_id, &message.job_type, &message.input)?;
        let result_url = executor.run(&self.resource).await?;

        self.publisher
            .publish_update(&UpdateMessage::completed(message.trace_id, message.job_id, result_url.clone()))
            .await?;
        Ok(result_url)
    }

    fn record_failure(&self, job_id: JobId) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let count = failures.entry(job_id).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_failures(&self, job_id: JobId) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&job_id);
    }

    async fn on_failure(&self, message: &SubmitMessage, err: WorkerError) -> HandlerError {
        let reason = err.to_string();
        // unbounded retries keep no per-job state
        let Some(max) = self.retry_max else {
            warn!(error = %reason, "job failed");
            return HandlerError::Requeue(reason);
        };

        let attempts = self.record_failure(message.job_id);
        if attempts < max {
            warn!(attempts, error = %reason, "job failed");
            return HandlerError::Requeue(reason);
        }

        let failed = UpdateMessage::failed(message.trace_id, message.job_id, reason.clone());
        if let Err(e) = self.publisher.publish_update(&failed).await {
            // keep the message alive until the terminal status is out
            warn!(error = %e, attempts, "could not publish FAILED, requeueing");
            return HandlerError::Requeue(reason);
        }
        self.clear_failures(message.job_id);
        error!(attempts, error = %reason, "job failed permanently");
        HandlerError::DeadLetter(reason)
    }

    #[cfg(test)]
    fn tracked_failures(&self) -> usize {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl<K: BrokerConnector> MessageHandler for PipelineWorker<K> {
    type Message = SubmitMessage;

    async fn handle(&self, message: SubmitMessage) -> Result<(), HandlerError> {
        match self.process(&message).await {
            Ok(result_url) => {
                self.clear_failures(message.job_id);
                info!(job_type = %message.job_type, result_url = %result_url, "job completed");
                Ok(())
            }
            Err(e) => Err(self.on_failure(&message, e).await),
        }
    }
}
