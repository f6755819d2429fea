use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::{Result, TransferError};
use crate::ports::{BlobStore, DeleteManyOutcome, PutOptions};

/// Blob store keeping objects in a `DashMap`, addressed as
/// `{base_url}/{destination}`.
#[derive(Debug)]
pub struct InMemoryBlobStore {
    base_url: String,
    objects: DashMap<String, Bytes>,
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new("mem://blobs")
    }
}

impl InMemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: DashMap::new(),
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.objects.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Seed an object directly, bypassing `put`.
    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.insert(url.into(), data.into());
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, data: Bytes, options: &PutOptions) -> Result<String> {
        if options.destination.is_empty() {
            return Err(TransferError::Service(
                "empty destination path".into(),
            ));
        }
        let url = format!(
            "{}/{}",
            self.base_url,
            options.destination.trim_start_matches('/')
        );
        self.objects.insert(url.clone(), data);
        Ok(url)
    }

    async fn get(&self, url: &str) -> Result<Bytes> {
        self.objects
            .get(url)
            .map(|b| b.value().clone())
            .ok_or_else(|| TransferError::NotFound(url.to_string()))
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        Ok(self.objects.remove(url).is_some())
    }

    async fn delete_many(&self, urls: &[String]) -> Result<DeleteManyOutcome> {
        let deleted_count = urls
            .iter()
            .filter(|url| self.objects.remove(url.as_str()).is_some())
            .count();
        Ok(DeleteManyOutcome { deleted_count })
    }
}
