//! `castline-core` — job domain primitives.
//!
//! Pure types only: identifiers, the job record and its status state machine.
//! No broker, storage or async concerns live here.

pub mod error;
pub mod id;
pub mod job;

pub use error::DomainError;
pub use id::{JobId, TraceId};
pub use job::{Job, JobStatus, StatusChange};
