//! Job records, producer-side submission and status application.
//!
//! ## Components
//!
//! - `JobStore`: persistence for job records (in-memory or Postgres)
//! - `Orchestrator`: validates a batch, records each job `Pending`, publishes it
//! - `StatusApplier`: applies worker status updates to the records

pub mod orchestrator;
pub mod postgres;
pub mod status;
pub mod store;

pub use orchestrator::{JobRequest, Orchestrator, SubmitError, SubmitReceipt};
pub use postgres::PostgresJobStore;
pub use status::{ApplyOutcome, StatusApplier};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
