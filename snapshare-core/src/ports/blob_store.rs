use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Hints passed along with an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct PutOptions {
    /// Suggested object path, e.g. `rooms/<room>/<uuid>.jpg`.
    pub destination: String,
    pub content_type: Option<String>,
    /// Encoder quality hint in `0.0..=1.0`; stores may ignore it.
    pub quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteManyOutcome {
    pub deleted_count: usize,
}

/// Opaque remote object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` and return the URL it can be fetched from.
    async fn put(&self, data: Bytes, options: &PutOptions) -> Result<String>;

    /// Fetch an object by URL. Missing objects fail with `NotFound`.
    async fn get(&self, url: &str) -> Result<Bytes>;

    /// Delete an object. Returns `true` if it existed.
    async fn delete(&self, url: &str) -> Result<bool>;

    async fn delete_many(&self, urls: &[String]) -> Result<DeleteManyOutcome>;
}
