//! Producer-side batch submission and status lookup.

use serde_json::{Map, Value as JsonValue};
use tracing::{info, instrument, warn};

use castline_core::{Job, JobId, TraceId};
use castline_events::{BrokerConnector, BrokerError, SubmitMessage};

use crate::broker::{PublishError, Publisher};

use super::store::{JobStore, JobStoreError};

/// One job of a submission batch.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub job_id: JobId,
    pub job_type: String,
    pub input: Map<String, JsonValue>,
}

/// What the producer reports back for an accepted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub trace_id: TraceId,
    pub job_ids: Vec<JobId>,
    /// Submit-queue depth sampled before publishing (approximate).
    pub queue_depth: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("batch must contain between 1 and {max} jobs, got {len}")]
    InvalidBatchSize { len: usize, max: usize },

    #[error("failed to sample queue depth: {0}")]
    QueueDepth(#[source] BrokerError),

    #[error("failed to create job record: {0}")]
    Store(#[from] JobStoreError),

    #[error("failed to publish job: {0}")]
    Publish(#[from] PublishError),
}

pub struct Orchestrator<K: BrokerConnector, S: JobStore> {
    store: S,
    publisher: Publisher<K>,
    max_jobs_per_request: usize,
}

impl<K: BrokerConnector, S: JobStore> Orchestrator<K, S> {
    pub fn new(store: S, publisher: Publisher<K>, max_jobs_per_request: usize) -> Self {
        Self {
            store,
            publisher,
            max_jobs_per_request,
        }
    }

    /// Create a `Pending` record and publish a submit message per job, in order.
    ///
    /// Size violations fail before any side effect. A failure midway leaves
    /// the earlier jobs submitted.
    #[instrument(skip(self, jobs), fields(trace_id = %trace_id, batch = jobs.len()))]
    pub async fn submit(&self, trace_id: TraceId, jobs: Vec<JobRequest>) -> Result<SubmitReceipt, SubmitError> {
        if jobs.is_empty() || jobs.len() > self.max_jobs_per_request {
            return Err(SubmitError::InvalidBatchSize {
                len: jobs.len(),
                max: self.max_jobs_per_request,
            });
        }

        let topology = self.publisher.topology();
        let queue_depth = topology
            .queue_depth(&topology.config().submit_queue)
            .await
            .map_err(SubmitError::QueueDepth)?;

        let mut job_ids = Vec::with_capacity(jobs.len());
        for request in jobs {
            let record = Job::pending(request.job_id, trace_id, request.job_type.clone());
            self.store.create(record).await?;

            let message = SubmitMessage::new(trace_id, request.job_id, request.job_type, request.input);
            if let Err(e) = self.publisher.publish_submit(&message).await {
                warn!(job_id = %request.job_id, error = %e, "submit publish failed");
                return Err(e.into());
            }
            job_ids.push(request.job_id);
        }

        info!(queue_depth, jobs = job_ids.len(), "batch submitted");
        Ok(SubmitReceipt {
            trace_id,
            job_ids,
            queue_depth,
        })
    }

    /// Current records for `ids`; unknown ids are omitted.
    pub async fn status(&self, ids: &[JobId]) -> Result<Vec<Job>, JobStoreError> {
        self.store.find_by_ids(ids).await
    }

    /// Ready messages in the submit queue.
    pub async fn queue_depth(&self) -> Result<u32, BrokerError> {
        let topology = self.publisher.topology();
        topology.queue_depth(&topology.config().submit_queue).await
    }
}
