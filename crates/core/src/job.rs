//! Job record and status state machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobId, TraceId};

/// Job execution status.
///
/// Transitions are monotonic along `Pending → Running → {Completed, Failed}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Record created, submit message published (or about to be).
    Pending,
    /// A worker picked the job up.
    Running,
    /// Finished with a result reference.
    Completed,
    /// Finished without a result.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    ///
    /// Skipping `Running` is allowed (its update may have been lost); moving
    /// backwards or between the two terminal states is not.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Outcome of applying a status update to a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// Status and/or fields were written.
    Applied { from: JobStatus, to: JobStatus },
    /// Same terminal status re-applied; nothing changed.
    Unchanged,
    /// The update would move the job backwards or out of a terminal state.
    Rejected { from: JobStatus, to: JobStatus },
}

/// Persisted job record, the source of truth for job status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub trace_id: TraceId,
    pub job_type: String,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new record in `Pending`.
    pub fn pending(id: JobId, trace_id: TraceId, job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            trace_id,
            job_type: job_type.into(),
            status: JobStatus::Pending,
            result_url: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status update.
    ///
    /// `result_url` and `message` are only written when present; absent fields
    /// keep their current value.
    pub fn apply_status(
        &mut self,
        status: JobStatus,
        result_url: Option<String>,
        message: Option<String>,
    ) -> StatusChange {
        let from = self.status;

        if from.is_terminal() && from == status {
            return StatusChange::Unchanged;
        }
        if from != status && !from.can_transition_to(status) {
            return StatusChange::Rejected { from, to: status };
        }

        self.status = status;
        if let Some(url) = result_url {
            self.result_url = Some(url);
        }
        if let Some(msg) = message {
            self.message = Some(msg);
        }
        self.updated_at = Utc::now();

        StatusChange::Applied { from, to: status }
    }
}
