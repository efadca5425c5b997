use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{BucketError, BucketStore};

/// Process-local container, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Bytes>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<(), BucketError> {
        self.lock().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BucketError::NotFound(key.to_string()))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
