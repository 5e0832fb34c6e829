use std::collections::HashMap;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Prefix under which every uploaded image is stored.
pub const UPLOAD_PREFIX: &str = "uploads/";

/// Opaque object storage for raw images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` and return the key it can be fetched with.
    async fn put(
        &self,
        data: &[u8],
        content_type: &str,
        original_filename: Option<&str>,
    ) -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Deleting a key that does not exist is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Build `uploads/<uuid>.<ext>`, taking the extension from the filename when
/// it has one and from the MIME subtype otherwise.
pub fn object_key(content_type: &str, original_filename: Option<&str>) -> String {
    let from_name = original_filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()));

    let ext = match from_name {
        Some(ext) => ext.to_ascii_lowercase(),
        None => match content_type.split_once('/') {
            Some((_, "jpeg")) => "jpg".to_string(),
            Some((_, "svg+xml")) => "svg".to_string(),
            Some((_, sub)) if !sub.is_empty() => sub.to_ascii_lowercase(),
            _ => "png".to_string(),
        },
    };

    format!("{UPLOAD_PREFIX}{}.{ext}", Uuid::new_v4())
}

/// Client for S3-compatible object storage (AWS S3, Cloudflare R2, MinIO).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

#[async_trait]
impl BlobStore for R2Client {
    async fn put(
        &self,
        data: &[u8],
        content_type: &str,
        original_filename: Option<&str>,
    ) -> Result<String, StorageError> {
        let key = object_key(content_type, original_filename);
        let response = self
            .bucket
            .put_object_with_content_type(&key, data, content_type)
            .await?;
        check_status(response.status_code(), &key)?;
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_status(response.status_code(), key)?;
        Ok(response.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        match response.status_code() {
            404 => Ok(()),
            code => check_status(code, key),
        }
    }
}

fn check_status(code: u16, key: &str) -> Result<(), StorageError> {
    match code {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        other => Err(StorageError::Status(other)),
    }
}

/// In-process blob store for tests and single-process development.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        data: &[u8],
        content_type: &str,
        original_filename: Option<&str>,
    ) -> Result<String, StorageError> {
        let key = object_key(content_type, original_filename);
        self.objects.write().await.insert(key.clone(), data.to_vec());
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object storage returned HTTP {0}")]
    Status(u16),

    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
