//! Broker payload schemas and their JSON codec.
//!
//! One encoded object per broker message:
//!
//! - submit: `{trace_id, job_id, job_type, input: {...}, enqueued_at}`
//! - update: `{trace_id, job_id, status, result_url?, message?}`

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use castline_core::{JobId, JobStatus, TraceId};

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message that can travel through a queue and be correlated in logs.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn trace_id(&self) -> TraceId;
    fn job_id(&self) -> JobId;
}

/// Request to run one job. Produced once per job by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitMessage {
    pub trace_id: TraceId,
    pub job_id: JobId,
    pub job_type: String,
    /// Opaque job-type specific input, validated by the worker's registry.
    pub input: Map<String, JsonValue>,
    pub enqueued_at: DateTime<Utc>,
}

impl SubmitMessage {
    pub fn new(
        trace_id: TraceId,
        job_id: JobId,
        job_type: impl Into<String>,
        input: Map<String, JsonValue>,
    ) -> Self {
        Self {
            trace_id,
            job_id,
            job_type: job_type.into(),
            input,
            enqueued_at: Utc::now(),
        }
    }
}

impl QueueMessage for SubmitMessage {
    fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// Status transition reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub trace_id: TraceId,
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl UpdateMessage {
    pub fn running(trace_id: TraceId, job_id: JobId) -> Self {
        Self {
            trace_id,
            job_id,
            status: JobStatus::Running,
            result_url: None,
            message: None,
        }
    }

    pub fn completed(trace_id: TraceId, job_id: JobId, result_url: impl Into<String>) -> Self {
        Self {
            trace_id,
            job_id,
            status: JobStatus::Completed,
            result_url: Some(result_url.into()),
            message: Some("success".to_string()),
        }
    }

    pub fn failed(trace_id: TraceId, job_id: JobId, message: impl Into<String>) -> Self {
        Self {
            trace_id,
            job_id,
            status: JobStatus::Failed,
            result_url: None,
            message: Some(message.into()),
        }
    }
}

impl QueueMessage for UpdateMessage {
    fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    fn job_id(&self) -> JobId {
        self.job_id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}

pub fn decode<M: DeserializeOwned>(body: &[u8]) -> Result<M, CodecError> {
    serde_json::from_slice(body).map_err(CodecError::Decode)
}
