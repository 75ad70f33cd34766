//! Blob storage: fetch by bucket/key, upload under a prefix.
//!
//! Uploaded objects get the key `"{prefix}/{uuid}.{extension}"` and are
//! referenced by `"{public_url}/{bucket}/{key}"`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Store `bytes` under a fresh key and return its public reference.
    async fn put(&self, bytes: Vec<u8>, bucket: &str, prefix: &str, extension: &str) -> Result<String, BlobError>;
}

fn new_key(prefix: &str, extension: &str) -> String {
    let name = Uuid::new_v4().simple();
    let prefix = prefix.trim_matches('/');
    let extension = extension.trim_start_matches('.');
    match (prefix.is_empty(), extension.is_empty()) {
        (true, true) => name.to_string(),
        (true, false) => format!("{name}.{extension}"),
        (false, true) => format!("{prefix}/{name}"),
        (false, false) => format!("{prefix}/{name}.{extension}"),
    }
}

fn public_url(base: &str, bucket: &str, key: &str) -> String {
    format!("{}/{bucket}/{key}", base.trim_end_matches('/'))
}

/// In-memory blob store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    public_url: String,
    gets: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            ..Self::default()
        }
    }

    pub fn insert(&self, bucket: &str, key: &str, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert((bucket.to_string(), key.to_string()), bytes.into());
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in a bucket.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .map(|objects| {
                objects
                    .keys()
                    .filter(|(b, _)| b == bucket)
                    .map(|(_, k)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of `get` calls served so far.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.object(bucket, key).ok_or_else(|| BlobError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    async fn put(&self, bytes: Vec<u8>, bucket: &str, prefix: &str, extension: &str) -> Result<String, BlobError> {
        let key = new_key(prefix, extension);
        self.insert(bucket, &key, bytes);
        Ok(public_url(&self.public_url, bucket, &key))
    }
}

/// Filesystem-backed blob store: `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into(),
        }
    }

    fn path_for(&self, bucket: &str, key: &str) -> Result<PathBuf, BlobError> {
        for part in [bucket, key] {
            let safe = !part.is_empty()
                && Path::new(part)
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !safe {
                return Err(BlobError::InvalidKey(format!("{bucket}/{key}")));
            }
        }
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(BlobError::Storage(format!("{}: {e}", path.display()))),
        }
    }

    async fn put(&self, bytes: Vec<u8>, bucket: &str, prefix: &str, extension: &str) -> Result<String, BlobError> {
        let key = new_key(prefix, extension);
        let path = self.path_for(bucket, &key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Storage(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| BlobError::Storage(format!("{}: {e}", path.display())))?;
        Ok(public_url(&self.public_url, bucket, &key))
    }
}
