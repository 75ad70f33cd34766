//! Applies worker status updates to job records.

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use castline_core::{JobStatus, StatusChange};
use castline_events::UpdateMessage;

use crate::broker::{HandlerError, MessageHandler};

use super::store::{JobStore, JobStoreError};

/// What applying one update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { from: JobStatus, to: JobStatus },
    /// Same terminal status again.
    Unchanged,
    /// Backward or terminal-changing transition, ignored.
    Ignored { from: JobStatus, to: JobStatus },
    /// No record for the job id; the update is dropped.
    UnknownJob,
}

/// Statuses only move forward, so a handful of re-reads always settles.
const MAX_CONFLICT_RETRIES: u32 = 8;

pub struct StatusApplier<S: JobStore> {
    store: S,
}

impl<S: JobStore> StatusApplier<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Read-modify-write of one record; at most one committed write per update.
    ///
    /// The write only lands if the record still has the status it was read
    /// with. When another update got there first the record is re-read and
    /// the guard evaluated again.
    #[instrument(
        skip_all,
        fields(trace_id = %update.trace_id, job_id = %update.job_id, status = %update.status),
        err
    )]
    pub async fn apply(&self, update: &UpdateMessage) -> Result<ApplyOutcome, JobStoreError> {
        let mut conflicts = 0;
        loop {
            let Some(mut job) = self.store.find_by_id(update.job_id).await? else {
                warn!("status update for unknown job dropped");
                return Ok(ApplyOutcome::UnknownJob);
            };

            match job.apply_status(update.status, update.result_url.clone(), update.message.clone()) {
                StatusChange::Applied { from, to } => match self.store.update(&job, from).await {
                    Ok(()) => {
                        info!(%from, %to, "job status updated");
                        return Ok(ApplyOutcome::Applied { from, to });
                    }
                    Err(JobStoreError::StatusConflict { .. }) if conflicts < MAX_CONFLICT_RETRIES => {
                        conflicts += 1;
                        debug!(conflicts, "record changed concurrently, re-reading");
                    }
                    Err(e) => return Err(e),
                },
                StatusChange::Unchanged => {
                    debug!("terminal status re-applied, nothing to do");
                    return Ok(ApplyOutcome::Unchanged);
                }
                StatusChange::Rejected { from, to } => {
                    warn!(%from, %to, "out-of-order status update ignored");
                    return Ok(ApplyOutcome::Ignored { from, to });
                }
            }
        }
    }
}

#[async_trait]
impl<S: JobStore + 'static> MessageHandler for StatusApplier<S> {
    type Message = UpdateMessage;

    async fn handle(&self, message: UpdateMessage) -> Result<(), HandlerError> {
        self.apply(&message)
            .await
            .map(|_| ())
            .map_err(|e| HandlerError::Requeue(e.to_string()))
    }
}
