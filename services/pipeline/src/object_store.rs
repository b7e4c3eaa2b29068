//! Object storage capability.
//!
//! The pipeline never moves image bytes; it only reads object descriptions
//! at ingestion and deletes objects when an image is invalidated.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors surfaced by an object store backend.
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Object store backend error: {0}")]
    Backend(String),
}

/// Description of a stored object.
#[derive(Debug, Clone, Default)]
pub struct ObjectStat {
    pub content_type: Option<String>,
    pub size: Option<i64>,
    /// Custom metadata tags attached at upload (e.g. `photographer`).
    pub tags: HashMap<String, String>,
}

/// Capability handle for the image bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Describe an object without fetching its bytes.
    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectStat, ObjectStoreError>;

    /// Delete an object. Deleting an already-missing object succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;
}

/// S3-backed object store.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Build a client, honoring custom endpoints for MinIO/LocalStack.
    pub async fn new(config: &crate::config::S3Config) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = aws_sdk_s3::Client::from_conf(builder.build());

        info!(region = %config.region, "S3 object store initialized");

        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectStat, ObjectStoreError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(head) => {
                let tags = head
                    .metadata()
                    .map(|m| m.clone())
                    .unwrap_or_default();

                Ok(ObjectStat {
                    content_type: head.content_type().map(String::from),
                    size: head.content_length(),
                    tags,
                })
            }
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Err(ObjectStoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    })
                } else {
                    Err(ObjectStoreError::Backend(e.to_string()))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        // S3 DeleteObject succeeds for missing keys, which matches the
        // tolerated "object already gone" redelivery case.
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        debug!(bucket = %bucket, key = %key, "Object deleted");
        Ok(())
    }
}

/// In-memory object store used by tests and local development.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: tokio::sync::RwLock<HashMap<(String, String), ObjectStat>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, as if it had been uploaded out of band.
    pub async fn put(&self, bucket: &str, key: &str, stat: ObjectStat) {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), stat);
    }

    pub async fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .await
            .contains_key(&(bucket.to_string(), key.to_string()))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectStat, ObjectStoreError> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let removed = self
            .objects
            .write()
            .await
            .remove(&(bucket.to_string(), key.to_string()));
        if removed.is_none() {
            warn!(bucket = %bucket, key = %key, "Object already gone, delete tolerated");
        }
        Ok(())
    }
}
