//! S3-compatible object storage
//!
//! Backed by the `object_store` crate; MinIO and other path-style endpoints
//! work through `with_endpoint`. Bucket creation is a presigned `PUT` on the
//! bucket root since the crate has no call for it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::object_store::aws::{AmazonS3, AmazonS3Builder};
use ::object_store::path::Path as ObjectPath;
use ::object_store::signer::Signer;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::storage::settings::ObjectStorageSettings;

/// Remote archive storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist
    async fn ensure_bucket(&self) -> Result<(), OrchestratorError>;

    async fn put(&self, key: &str, local: &Path) -> Result<(), OrchestratorError>;

    async fn get(&self, key: &str, local: &Path) -> Result<(), OrchestratorError>;
}

const PRESIGN_TTL: Duration = Duration::from_secs(300);

pub struct S3ObjectStore {
    store: Arc<dyn ::object_store::ObjectStore>,
    bucket: String,

    /// Present only for real S3 endpoints
    creator: Option<BucketCreator>,
}

struct BucketCreator {
    s3: Arc<AmazonS3>,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn new(settings: &ObjectStorageSettings) -> Result<Self, OrchestratorError> {
        let builder = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_endpoint(&settings.endpoint)
            .with_allow_http(settings.endpoint.starts_with("http://"))
            .with_access_key_id(&settings.access_key)
            .with_secret_access_key(settings.secret_key.expose_secret());
        let s3 = Arc::new(builder.build().map_err(|e| {
            OrchestratorError::ConfigError(format!("invalid object storage settings: {}", e))
        })?);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            store: s3.clone(),
            bucket: settings.bucket.clone(),
            creator: Some(BucketCreator { s3, client }),
        })
    }

    /// Wraps an already configured store that cannot create buckets
    pub fn with_store(store: Arc<dyn ::object_store::ObjectStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            creator: None,
        }
    }

    async fn create_bucket(&self, creator: &BucketCreator) -> Result<(), OrchestratorError> {
        let url = creator
            .s3
            .signed_url(Method::PUT, &ObjectPath::from(""), PRESIGN_TTL)
            .await
            .map_err(|e| self.unavailable("bucket creation", e))?;
        let response = creator.client.put(url).send().await?;
        match response.status() {
            status if status.is_success() => {
                info!("Created bucket {}", self.bucket);
                Ok(())
            }
            // BucketAlreadyOwnedByYou
            StatusCode::CONFLICT => Ok(()),
            status => Err(OrchestratorError::ConnectionError(format!(
                "object storage bucket creation of {} failed with status {}",
                self.bucket, status
            ))),
        }
    }

    fn unavailable(&self, action: &str, e: ::object_store::Error) -> OrchestratorError {
        OrchestratorError::ConnectionError(format!(
            "object storage {} in bucket {} failed: {}",
            action, self.bucket, e
        ))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self) -> Result<(), OrchestratorError> {
        let listed = self.store.list_with_delimiter(None).await;
        match (listed, &self.creator) {
            (Ok(_), _) => {
                debug!("Bucket {} is reachable", self.bucket);
                Ok(())
            }
            (Err(e), Some(creator)) => {
                debug!("Bucket {} not listable ({}), creating it", self.bucket, e);
                self.create_bucket(creator).await
            }
            (Err(e), None) => Err(self.unavailable("bucket check", e)),
        }
    }

    async fn put(&self, key: &str, local: &Path) -> Result<(), OrchestratorError> {
        let data = tokio::fs::read(local).await?;
        let size = data.len();
        self.store
            .put(&ObjectPath::from(key), data.into())
            .await
            .map_err(|e| self.unavailable("upload", e))?;
        info!("Uploaded {} ({} bytes)", key, size);
        Ok(())
    }

    async fn get(&self, key: &str, local: &Path) -> Result<(), OrchestratorError> {
        let result = match self.store.get(&ObjectPath::from(key)).await {
            Ok(result) => result,
            Err(::object_store::Error::NotFound { .. }) => {
                return Err(OrchestratorError::NotFound(format!("object {}", key)))
            }
            Err(e) => return Err(self.unavailable("download", e)),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|e| self.unavailable("download", e))?;
        tokio::fs::write(local, &bytes).await?;
        info!("Downloaded {} ({} bytes)", key, bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ::object_store::memory::InMemory;
    use secrecy::SecretString;

    use super::*;

    fn memory_store() -> S3ObjectStore {
        S3ObjectStore::with_store(Arc::new(InMemory::new()), "backups")
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrips_archive() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("b1.sql.gz");
        tokio::fs::write(&archive, b"dump").await.unwrap();

        let store = memory_store();
        store.ensure_bucket().await.unwrap();
        store.put("backups/databases/db1/b1.sql.gz", &archive).await.unwrap();

        let restored = temp.path().join("restored.sql.gz");
        store.get("backups/databases/db1/b1.sql.gz", &restored).await.unwrap();
        assert_eq!(tokio::fs::read(&restored).await.unwrap(), b"dump");
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let err = memory_store()
            .get("backups/apps/a1/none.tar.gz", &temp.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_builds_from_settings() {
        let settings = ObjectStorageSettings {
            endpoint: "http://127.0.0.1:9000".to_string(),
            region: "us-east-1".to_string(),
            bucket: "backups".to_string(),
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: SecretString::from("secret".to_string()),
        };
        assert!(S3ObjectStore::new(&settings).is_ok());
    }
}
