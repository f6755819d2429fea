use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use snapshare_model::LocalFile;

use crate::config::TimeoutConfig;
use crate::error::{Result, TransferError};
use crate::ports::{BlobStore, PutOptions};

/// Single-item upload/download with a hard timeout.
///
/// On timeout the in-flight store future is dropped, which aborts the
/// underlying request. Holds no mutable state, so clones can run
/// concurrently for independent items.
#[derive(Clone)]
pub struct BlobTransferClient {
    store: Arc<dyn BlobStore>,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for BlobTransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobTransferClient")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl BlobTransferClient {
    pub fn new(store: Arc<dyn BlobStore>, timeouts: TimeoutConfig) -> Self {
        Self { store, timeouts }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Read `file` and store it under `destination_hint`, returning the
    /// remote URL. No database record is written.
    pub async fn upload(
        &self,
        file: &LocalFile,
        destination_hint: &str,
        quality_hint: f32,
    ) -> Result<String> {
        let data = tokio::fs::read(file.path()).await?;
        let options = PutOptions {
            destination: destination_hint.to_string(),
            content_type: file.extension().as_deref().and_then(content_type_for),
            quality: quality_hint.clamp(0.0, 1.0),
        };

        let limit = self.timeouts.upload();
        bounded(limit, "upload", self.store.put(Bytes::from(data), &options))
            .await
    }

    pub async fn download(&self, remote_url: &str) -> Result<Bytes> {
        let limit = self.timeouts.download();
        bounded(limit, "download", self.store.get(remote_url)).await
    }
}

async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Network(format!(
            "{what} timed out after {}s",
            limit.as_secs_f32()
        ))),
    }
}

/// MIME type for common photo extensions.
pub fn content_type_for(extension: &str) -> Option<String> {
    let mime = match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => return None,
    };
    Some(mime.to_string())
}
