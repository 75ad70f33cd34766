//! `recast` job type: apply a template image onto a source image.
//!
//! - prepare: fetch the source; the template comes from the asset cache or is
//!   fetched concurrently with the source and then cached
//! - execute: the configured [`Transform`]
//! - post: upload to the source bucket under `recast_results/`, keeping the
//!   source key's (lowercased) extension

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};
use validator::Validate;

use castline_core::JobId;

use crate::blob::BlobStore;

use super::cache::AssetCache;
use super::executor::{ExecutorError, Pipeline};
use super::transform::{RecastInputs, Transform};

pub const RESULT_PREFIX: &str = "recast_results";
const FALLBACK_EXTENSION: &str = "bin";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
pub struct RecastInput {
    #[validate(length(min = 1))]
    pub source_image_bucket: String,
    #[validate(length(min = 1))]
    pub source_image_key: String,
    #[validate(length(min = 1))]
    pub template_image_bucket: String,
    #[validate(length(min = 1))]
    pub template_image_key: String,
}

impl RecastInput {
    /// Deserialize and validate a raw submit payload.
    pub fn parse(raw: &Map<String, JsonValue>) -> Result<Self, String> {
        let input: Self = serde_json::from_value(JsonValue::Object(raw.clone())).map_err(|e| e.to_string())?;
        input.validate().map_err(|e| e.to_string())?;
        Ok(input)
    }

    pub fn template_cache_key(&self) -> String {
        format!("{}/{}", self.template_image_bucket, self.template_image_key)
    }

    /// Extension of the source key, lowercased, without the dot.
    pub fn result_extension(&self) -> String {
        Path::new(&self.source_image_key)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map(str::to_lowercase)
            .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
    }
}

/// Model weights fetched once per worker at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAsset {
    pub bucket: String,
    pub key: String,
    pub dir: PathBuf,
}

/// Shared collaborators of every `recast` job.
#[derive(Clone)]
pub struct RecastDescriptor {
    blobs: Arc<dyn BlobStore>,
    cache: Arc<AssetCache>,
    transform: Arc<dyn Transform>,
    model: Option<ModelAsset>,
}

impl RecastDescriptor {
    pub const NAME: &'static str = "recast";

    pub fn new(blobs: Arc<dyn BlobStore>, cache: Arc<AssetCache>, transform: Arc<dyn Transform>) -> Self {
        Self {
            blobs,
            cache,
            transform,
            model: None,
        }
    }

    pub fn with_model(mut self, model: ModelAsset) -> Self {
        self.model = Some(model);
        self
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    pub fn create(&self, job_id: JobId, input: RecastInput) -> RecastJob {
        RecastJob {
            job_id,
            input,
            blobs: self.blobs.clone(),
            cache: self.cache.clone(),
            transform: self.transform.clone(),
        }
    }

    /// Download the model weights into the model dir unless already present.
    pub async fn warmup(&self) -> Result<(), ExecutorError> {
        let Some(model) = &self.model else {
            return Ok(());
        };

        let file_name = Path::new(&model.key)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| model.key.clone().into());
        let path = model.dir.join(file_name);
        if tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "model already present");
            return Ok(());
        }

        let bytes = self.blobs.get(&model.bucket, &model.key).await?;
        tokio::fs::create_dir_all(&model.dir).await?;
        tokio::fs::write(&path, &bytes).await?;
        info!(path = %path.display(), size = bytes.len(), "model downloaded");
        Ok(())
    }
}

/// One validated `recast` job, ready to run.
pub struct RecastJob {
    job_id: JobId,
    input: RecastInput,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<AssetCache>,
    transform: Arc<dyn Transform>,
}

impl RecastJob {
    pub fn input(&self) -> &RecastInput {
        &self.input
    }
}

#[async_trait]
impl Pipeline for RecastJob {
    type Inputs = RecastInputs;

    fn job_id(&self) -> JobId {
        self.job_id
    }

    async fn prepare(&self) -> Result<RecastInputs, ExecutorError> {
        let input = &self.input;
        let template_key = input.template_cache_key();

        let (source, template) = match self.cache.get(&template_key) {
            Some(template) => {
                debug!(key = %template_key, "template cache hit");
                let source = self
                    .blobs
                    .get(&input.source_image_bucket, &input.source_image_key)
                    .await?;
                (source, template)
            }
            None => {
                let (source, template) = tokio::join!(
                    self.blobs.get(&input.source_image_bucket, &input.source_image_key),
                    self.blobs.get(&input.template_image_bucket, &input.template_image_key),
                );
                let template = Arc::new(template?);
                self.cache.insert(template_key, template.clone());
                (source?, template)
            }
        };

        Ok(RecastInputs {
            source: Arc::new(source),
            template,
            extension: input.result_extension(),
        })
    }

    fn execute(&self, inputs: RecastInputs) -> Result<Vec<u8>, ExecutorError> {
        self.transform.run(self.job_id, &inputs)
    }

    async fn post(&self, output: Vec<u8>) -> Result<String, ExecutorError> {
        let url = self
            .blobs
            .put(
                output,
                &self.input.source_image_bucket,
                RESULT_PREFIX,
                &self.input.result_extension(),
            )
            .await?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::blob::InMemoryBlobStore;
    use crate::pipelines::executor::{run_pipeline, ExclusiveResource};

    struct Concat;

    impl Transform for Concat {
        fn run(&self, _job_id: JobId, inputs: &RecastInputs) -> Result<Vec<u8>, ExecutorError> {
            Ok([inputs.source.as_slice(), inputs.template.as_slice()].concat())
        }
    }

    fn raw(source_key: &str) -> Map<String, JsonValue> {
        json!({
            "source_image_bucket": "media",
            "source_image_key": source_key,
            "template_image_bucket": "templates",
            "template_image_key": "t1.png",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn descriptor() -> (Arc<InMemoryBlobStore>, RecastDescriptor) {
        let blobs = Arc::new(InMemoryBlobStore::new("http://cdn"));
        blobs.insert("media", "in/a.PNG", b"src".to_vec());
        blobs.insert("templates", "t1.png", b"tpl".to_vec());
        let descriptor = RecastDescriptor::new(blobs.clone(), Arc::new(AssetCache::new(1024)), Arc::new(Concat));
        (blobs, descriptor)
    }

    #[test]
    fn rejects_missing_and_empty_fields() {
        let mut missing = raw("a.png");
        missing.remove("template_image_key");
        assert!(RecastInput::parse(&missing).unwrap_err().contains("template_image_key"));

        let mut empty = raw("a.png");
        empty.insert("source_image_bucket".to_string(), json!(""));
        assert!(RecastInput::parse(&empty).is_err());
    }

    #[test]
    fn result_extension_is_lowercased_source_extension() {
        assert_eq!(RecastInput::parse(&raw("x/y.JPG")).unwrap().result_extension(), "jpg");
        assert_eq!(RecastInput::parse(&raw("noext")).unwrap().result_extension(), "bin");
    }

    #[tokio::test]
    async fn runs_and_uploads_into_source_bucket() {
        let (blobs, descriptor) = descriptor();
        let job = descriptor.create(JobId::new(), RecastInput::parse(&raw("in/a.PNG")).unwrap());

        let url = run_pipeline(Arc::new(job), &ExclusiveResource::new()).await.unwrap();

        assert!(url.starts_with("http://cdn/media/recast_results/"));
        assert!(url.ends_with(".png"));
        let key = url.trim_start_matches("http://cdn/media/");
        assert_eq!(blobs.object("media", key).unwrap(), b"srctpl");
    }

    #[tokio::test]
    async fn cached_template_is_fetched_once() {
        let (blobs, descriptor) = descriptor();
        let resource = ExclusiveResource::new();
        for _ in 0..2 {
            let job = descriptor.create(JobId::new(), RecastInput::parse(&raw("in/a.PNG")).unwrap());
            run_pipeline(Arc::new(job), &resource).await.unwrap();
        }
        // 2 source fetches + 1 template fetch
        assert_eq!(blobs.get_count(), 3);
        assert_eq!(descriptor.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn missing_source_fails_prepare() {
        let (_blobs, descriptor) = descriptor();
        let job = descriptor.create(JobId::new(), RecastInput::parse(&raw("in/missing.png")).unwrap());
        let err = run_pipeline(Arc::new(job), &ExclusiveResource::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Blob(_)));
    }

    #[tokio::test]
    async fn warmup_downloads_model_once() {
        let dir = tempfile::tempdir().unwrap();
        let (blobs, descriptor) = descriptor();
        blobs.insert("media", "models/weights.onnx", b"weights".to_vec());
        let descriptor = descriptor.with_model(ModelAsset {
            bucket: "media".to_string(),
            key: "models/weights.onnx".to_string(),
            dir: dir.path().to_path_buf(),
        });

        descriptor.warmup().await.unwrap();
        descriptor.warmup().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("weights.onnx")).unwrap(), b"weights");
        assert_eq!(blobs.get_count(), 1);
    }
}
