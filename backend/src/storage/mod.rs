#[cfg(test)]
pub mod memory;
pub mod s3_service;

use std::future::Future;
use std::time::Duration;

use sha2::{Digest, Sha256};

pub const MAX_IMAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("Object {0} not found in any candidate bucket")]
    NotFoundInAnyBucket(String),
    #[error("S3 error: {0}")]
    S3(String),
    #[error("Invalid file format")]
    InvalidFormat,
    #[error("File too large")]
    FileTooLarge,
}

/// Object store holding submitted photographs and rendered analysis images.
pub trait ObjectStore: Send + Sync + 'static {
    fn download(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<Vec<u8>, StorageError>> + Send;

    /// `true` once the object is stored; failures are logged by the store.
    fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = bool> + Send;

    fn exists(&self, bucket: &str, key: &str) -> impl Future<Output = bool> + Send;

    fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Option<String>> + Send;
}

/// Downloads `key` from the first bucket of `buckets` that has it.
pub async fn download_from_candidates<S: ObjectStore>(
    store: &S,
    buckets: &[String],
    key: &str,
) -> Result<Vec<u8>, StorageError> {
    for bucket in buckets {
        match store.download(bucket, key).await {
            Ok(bytes) => {
                log::info!("Downloaded {} from bucket {}", key, bucket);
                return Ok(bytes);
            }
            Err(StorageError::NotFound { .. }) => {
                log::debug!("{} not in bucket {}", key, bucket);
            }
            Err(e) => {
                log::warn!("Failed to download {} from bucket {}: {}", key, bucket, e);
            }
        }
    }
    Err(StorageError::NotFoundInAnyBucket(key.to_string()))
}

/// Presigned URL of `key` in the first candidate bucket that holds it.
pub async fn presign_from_candidates<S: ObjectStore>(
    store: &S,
    buckets: &[String],
    key: &str,
    ttl: Duration,
) -> Option<String> {
    for bucket in buckets {
        if store.exists(bucket, key).await {
            return store.presigned_url(bucket, key, ttl).await;
        }
    }
    None
}

pub fn calculate_image_hash(image_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_data);
    hex::encode(hasher.finalize())
}

pub fn extract_file_extension(mime_type: &str) -> Result<&'static str, StorageError> {
    match mime_type {
        "image/jpeg" | "image/jpg" => Ok("jpg"),
        "image/png" => Ok("png"),
        "image/webp" => Ok("webp"),
        "image/bmp" => Ok("bmp"),
        "image/tiff" => Ok("tiff"),
        _ => Err(StorageError::InvalidFormat),
    }
}

pub fn validate_image_size(image_data: &[u8]) -> Result<(), StorageError> {
    if image_data.len() > MAX_IMAGE_SIZE {
        return Err(StorageError::FileTooLarge);
    }
    Ok(())
}

/// Key of an image uploaded through the API: the client's file name when it
/// has one, the content hash otherwise.
pub fn generate_upload_key(
    application_id: &str,
    file_name: Option<&str>,
    image_data: &[u8],
    file_extension: &str,
) -> String {
    let stem = file_name
        .and_then(|name| name.rsplit(['/', '\\']).next())
        .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem))
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| calculate_image_hash(image_data));
    format!("applications/{}/{}.{}", application_id, stem, file_extension)
}
