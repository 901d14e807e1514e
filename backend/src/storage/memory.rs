use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{ObjectStore, StorageError};

/// In-process object store for tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), (Vec<u8>, String)>>,
    downloads: Mutex<Vec<String>>,
    pub fail_uploads: AtomicBool,
}

impl MemoryStore {
    pub fn insert(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            (bytes, "application/octet-stream".to_string()),
        );
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Keys requested through `download`, in order, across all buckets.
    pub fn downloaded_keys(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }
}

impl ObjectStore for MemoryStore {
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.downloads.lock().unwrap().push(key.to_string());
        self.get(bucket, key)
            .map(|(bytes, _)| bytes)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> bool {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return false;
        }
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            (bytes, content_type.to_string()),
        );
        true
    }

    async fn exists(&self, bucket: &str, key: &str) -> bool {
        self.get(bucket, key).is_some()
    }

    async fn presigned_url(&self, bucket: &str, key: &str, ttl: Duration) -> Option<String> {
        Some(format!(
            "memory://{}/{}?expires={}",
            bucket,
            key,
            ttl.as_secs()
        ))
    }
}
