//! Job type registry: name → descriptor.
//!
//! Descriptors are a closed set of variants registered at startup. Adding a
//! job type means adding a variant here and registering it; the orchestrator
//! and the worker loop do not change.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use tracing::info;

use castline_core::JobId;

use super::executor::{run_pipeline, ExclusiveResource, ExecutorError};
use super::recast::{RecastDescriptor, RecastInput, RecastJob};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid pipeline type: {0}")]
    UnknownJobType(String),

    #[error("invalid input for {job_type}: {detail}")]
    InvalidInput { job_type: String, detail: String },
}

#[derive(Clone)]
pub enum JobDescriptor {
    Recast(RecastDescriptor),
}

impl JobDescriptor {
    pub fn name(&self) -> &'static str {
        match self {
            JobDescriptor::Recast(_) => RecastDescriptor::NAME,
        }
    }

    fn create_executor(&self, job_id: JobId, raw_input: &Map<String, JsonValue>) -> Result<JobExecutor, RegistryError> {
        match self {
            JobDescriptor::Recast(descriptor) => {
                let input = RecastInput::parse(raw_input).map_err(|detail| RegistryError::InvalidInput {
                    job_type: self.name().to_string(),
                    detail,
                })?;
                Ok(JobExecutor::Recast(descriptor.create(job_id, input)))
            }
        }
    }

    async fn warmup(&self) -> Result<(), ExecutorError> {
        match self {
            JobDescriptor::Recast(descriptor) => descriptor.warmup().await,
        }
    }
}

/// A validated job bound to its input, ready to run.
pub enum JobExecutor {
    Recast(RecastJob),
}

impl JobExecutor {
    /// Run prepare / execute / post; returns the result reference.
    pub async fn run(self, resource: &ExclusiveResource) -> Result<String, ExecutorError> {
        match self {
            JobExecutor::Recast(job) => run_pipeline(Arc::new(job), resource).await,
        }
    }
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    descriptors: BTreeMap<String, JobDescriptor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a descriptor under its name.
    pub fn register(&mut self, descriptor: JobDescriptor) -> &mut Self {
        self.descriptors.insert(descriptor.name().to_string(), descriptor);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    pub fn create_executor(
        &self,
        job_id: JobId,
        job_type: &str,
        raw_input: &Map<String, JsonValue>,
    ) -> Result<JobExecutor, RegistryError> {
        self.descriptors
            .get(job_type)
            .ok_or_else(|| RegistryError::UnknownJobType(job_type.to_string()))?
            .create_executor(job_id, raw_input)
    }

    /// Warm up every registered job type.
    pub async fn warmup(&self) -> Result<(), ExecutorError> {
        for (name, descriptor) in &self.descriptors {
            descriptor.warmup().await?;
            info!(job_type = %name, "job type ready");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::blob::InMemoryBlobStore;
    use crate::pipelines::cache::AssetCache;
    use crate::pipelines::transform::{RecastInputs, Transform};

    struct Noop;

    impl Transform for Noop {
        fn run(&self, _job_id: JobId, _inputs: &RecastInputs) -> Result<Vec<u8>, ExecutorError> {
            Ok(Vec::new())
        }
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register(JobDescriptor::Recast(RecastDescriptor::new(
            Arc::new(InMemoryBlobStore::new("http://cdn")),
            Arc::new(AssetCache::new(1024)),
            Arc::new(Noop),
        )));
        registry
    }

    #[test]
    fn unknown_type_names_the_type() {
        let err = registry()
            .create_executor(JobId::new(), "upscale", &Map::new())
            .err()
            .unwrap();
        assert_eq!(err, RegistryError::UnknownJobType("upscale".to_string()));
        assert_eq!(err.to_string(), "invalid pipeline type: upscale");
    }

    #[test]
    fn invalid_input_carries_detail() {
        let raw = json!({ "source_image_bucket": "media" }).as_object().cloned().unwrap();
        let err = registry().create_executor(JobId::new(), "recast", &raw).err().unwrap();
        match err {
            RegistryError::InvalidInput { job_type, detail } => {
                assert_eq!(job_type, "recast");
                assert!(detail.contains("source_image_key"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn valid_input_builds_executor() {
        let raw = json!({
            "source_image_bucket": "media",
            "source_image_key": "a.png",
            "template_image_bucket": "media",
            "template_image_key": "t.png",
        })
        .as_object()
        .cloned()
        .unwrap();
        assert!(matches!(
            registry().create_executor(JobId::new(), "recast", &raw),
            Ok(JobExecutor::Recast(_))
        ));
        assert_eq!(registry().names(), vec!["recast"]);
    }
}
