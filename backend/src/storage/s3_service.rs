use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;

use super::{ObjectStore, StorageError, validate_image_size};
use crate::config::AppConfig;

#[derive(Clone)]
pub struct S3Service {
    client: Client,
}

impl S3Service {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client for AWS or, with `S3_ENDPOINT` set, an S3-compatible store such
    /// as MinIO (path-style addressing).
    pub async fn from_config(config: &AppConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.aws_region.clone()));
        if let (Some(access_key), Some(secret_key)) = (&config.s3_access_key, &config.s3_secret_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "static",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.s3_endpoint {
            log::info!("Using S3-compatible endpoint {}", endpoint);
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()))
    }
}

impl ObjectStore for S3Service {
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StorageError::S3(service_error.to_string())
                }
            })?;

        let body = result
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> bool {
        if let Err(e) = validate_image_size(&bytes) {
            log::error!("Refusing to upload {}/{}: {}", bucket, key, e);
            return false;
        }

        match self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
        {
            Ok(_) => {
                log::info!("Uploaded {}/{}", bucket, key);
                true
            }
            Err(e) => {
                log::error!("Failed to upload {}/{}: {}", bucket, key, e);
                false
            }
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> bool {
        self.client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .is_ok()
    }

    async fn presigned_url(&self, bucket: &str, key: &str, ttl: Duration) -> Option<String> {
        let presigning = match PresigningConfig::expires_in(ttl) {
            Ok(presigning) => presigning,
            Err(e) => {
                log::error!("Invalid presigned URL lifetime {:?}: {}", ttl, e);
                return None;
            }
        };
        match self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
        {
            Ok(request) => Some(request.uri().to_string()),
            Err(e) => {
                log::error!("Failed to presign {}/{}: {}", bucket, key, e);
                None
            }
        }
    }
}
