//! Worker-side job execution.
//!
//! - `registry`: job type name → descriptor, input validation
//! - `executor`: prepare / exclusive execute / post
//! - `cache`: byte-bounded LRU for fetched assets
//! - `recast`: the `recast` job type
//! - `transform`: the external compute step
//! - `worker`: submit-queue handler publishing status updates

pub mod cache;
pub mod executor;
pub mod recast;
pub mod registry;
pub mod transform;
pub mod worker;

pub use cache::{AssetCache, CacheStats};
pub use executor::{run_pipeline, ExclusiveResource, ExecutorError, LockTiming, Pipeline};
pub use recast::{ModelAsset, RecastDescriptor, RecastInput, RecastJob};
pub use registry::{JobDescriptor, JobExecutor, JobRegistry, RegistryError};
pub use transform::{ProcessTransform, RecastInputs, Transform};
pub use worker::{PipelineWorker, WorkerError};
