//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use castline_core::{Job, JobId, JobStatus};

/// Job store abstraction. Records are never deleted through it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record.
    async fn create(&self, job: Job) -> Result<(), JobStoreError>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Existing records among `ids`, in the order requested.
    async fn find_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, JobStoreError>;

    /// Overwrite an existing record, provided its stored status is still
    /// `expected`. Otherwise fails with `StatusConflict` and writes nothing.
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is no longer {expected}")]
    StatusConflict { id: JobId, expected: JobStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Arrange `jobs` in the order of `ids`, skipping ids with no record.
/// A requested id that repeats yields its record each time.
pub(crate) fn order_by_request(ids: &[JobId], jobs: Vec<Job>) -> Vec<Job> {
    let by_id: HashMap<JobId, Job> = jobs.into_iter().map(|job| (job.id, job)).collect();
    ids.iter().filter_map(|id| by_id.get(id).cloned()).collect()
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn create(&self, job: Job) -> Result<(), JobStoreError> {
        (**self).create(job).await
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_id(id).await
    }

    async fn find_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_ids(ids).await
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        (**self).update(job, expected).await
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(ids.iter().filter_map(|id| jobs.get(id).cloned()).collect())
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&job.id) {
            Some(slot) if slot.status == expected => {
                *slot = job.clone();
                Ok(())
            }
            Some(_) => Err(JobStoreError::StatusConflict { id: job.id, expected }),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }
}
