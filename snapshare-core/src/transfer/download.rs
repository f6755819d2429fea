//! Bulk save of remote media into the device library.
//!
//! Items are processed one at a time, and so are batches: a call made while
//! another is running waits for it, so the progress channel always
//! describes a single batch. A failing item is logged and skipped; only a
//! denied or failed permission request stops the batch, and that happens
//! before any transfer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapshare_model::{MediaItem, remote_extension};
use tokio::sync::{Mutex, watch};

use crate::config::DownloadConfig;
use crate::error::Result;
use crate::local_cache::LocalCacheStore;
use crate::ports::{KeyValueStore, MediaLibrary};
use crate::transfer::client::BlobTransferClient;
use crate::transfer::job::BatchId;
use crate::transfer::progress::{BatchOutcome, BatchPhase, BatchSnapshot};

/// Flag recording that the library permission prompt has been shown.
pub const PERMISSION_REQUESTED_KEY: &str = "permissions/media-library/requested";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// `count > 0`.
    pub success: bool,
    /// Items saved to the library.
    pub count: usize,
    pub failed: usize,
    pub permission_denied: bool,
}

impl DownloadReport {
    fn saved(count: usize, failed: usize) -> Self {
        Self {
            success: count > 0,
            count,
            failed,
            permission_denied: false,
        }
    }

    fn denied() -> Self {
        Self {
            permission_denied: true,
            ..Self::default()
        }
    }

    pub fn outcome(&self) -> BatchOutcome {
        if self.permission_denied {
            return BatchOutcome::AllFailed;
        }
        BatchOutcome::from_counts(self.count, self.failed)
    }
}

pub struct DownloadCoordinator {
    client: BlobTransferClient,
    library: Arc<dyn MediaLibrary>,
    cache: Option<Arc<LocalCacheStore>>,
    kv: Option<Arc<dyn KeyValueStore>>,
    config: DownloadConfig,
    progress: watch::Sender<Option<BatchSnapshot>>,
    running: Mutex<()>,
}

impl fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("client", &self.client)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DownloadCoordinator {
    pub fn new(
        client: BlobTransferClient,
        library: Arc<dyn MediaLibrary>,
        config: DownloadConfig,
    ) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            client,
            library,
            cache: None,
            kv: None,
            config,
            progress,
            running: Mutex::new(()),
        }
    }

    /// Serve cached files first and cache fresh downloads.
    pub fn with_cache(mut self, cache: Arc<LocalCacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Persist the "permission requested" flag in `kv`.
    pub fn with_kv(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Snapshots of the running or most recent batch.
    pub fn watch_progress(&self) -> watch::Receiver<Option<BatchSnapshot>> {
        self.progress.subscribe()
    }

    /// Whether the library permission has been requested on this device
    /// before.
    pub async fn permission_previously_requested(&self) -> bool {
        let Some(kv) = &self.kv else {
            return false;
        };
        matches!(kv.get(PERMISSION_REQUESTED_KEY).await, Ok(Some(_)))
    }

    /// Save `items` into the configured album.
    pub async fn download_selection(&self, items: &[MediaItem]) -> DownloadReport {
        self.download_selection_to(items, &self.config.album_name).await
    }

    /// Save `items` into `album`. Never fails per item; see
    /// [`DownloadReport`]. Waits for any batch already running.
    pub async fn download_selection_to(
        &self,
        items: &[MediaItem],
        album: &str,
    ) -> DownloadReport {
        let _running = self.running.lock().await;
        let permission = self.library.request_write_permission().await;
        self.remember_permission_request().await;
        match permission {
            Ok(status) if status.is_granted() => {}
            Ok(_) => {
                tracing::info!(target: "transfer::download", "library permission denied");
                return DownloadReport::denied();
            }
            Err(e) if e.is_permission() => {
                tracing::info!(target: "transfer::download", error = %e, "library permission denied");
                return DownloadReport::denied();
            }
            Err(e) => {
                tracing::error!(target: "transfer::download", error = %e, "library permission request failed");
                return DownloadReport::default();
            }
        }

        let batch_id = BatchId::new();
        let staging = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(target: "transfer::download", error = %e, "cannot create staging directory");
                return DownloadReport::default();
            }
        };
        self.progress
            .send_replace(Some(BatchSnapshot::new(batch_id, items.len())));
        tracing::info!(target: "transfer::download", %batch_id, total = items.len(), album, "download batch started");

        let (mut count, mut failed) = (0, 0);
        for item in items {
            match self.save_one(item, album, staging.path()).await {
                Ok(()) => count += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        target: "transfer::download",
                        media_id = %item.id,
                        url = %item.remote_url,
                        error = %e,
                        "skipping item"
                    );
                }
            }
            self.progress.send_modify(|snapshot| {
                if let Some(s) = snapshot {
                    s.completed = count;
                    s.failed = failed;
                    s.reported_progress = s.resolved() as f32 / s.total.max(1) as f32;
                }
            });
        }

        let report = DownloadReport::saved(count, failed);
        let outcome = report.outcome();
        self.progress.send_modify(|snapshot| {
            if let Some(s) = snapshot {
                s.reported_progress = 1.0;
                s.phase = BatchPhase::Completed(outcome);
            }
        });
        tracing::info!(target: "transfer::download", %batch_id, count, failed, "download batch finished");
        report
    }

    async fn save_one(&self, item: &MediaItem, album: &str, staging: &Path) -> Result<()> {
        let local = self.resolve_source(item, staging).await?;
        self.library.save(&local, album).await?;
        Ok(())
    }

    /// A valid cache entry if there is one, else a fresh download.
    async fn resolve_source(&self, item: &MediaItem, staging: &Path) -> Result<PathBuf> {
        if let Some(cache) = &self.cache {
            return Ok(cache
                .cache_remote(&item.remote_url, &self.client)
                .await?
                .local_path);
        }

        let bytes = self.client.download(&item.remote_url).await?;
        let ext = remote_extension(&item.remote_url)?.unwrap_or_else(|| "jpg".into());
        let path = staging.join(format!("{}.{ext}", item.id));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }

    async fn remember_permission_request(&self) {
        if let Some(kv) = &self.kv
            && let Err(e) = kv.set(PERMISSION_REQUESTED_KEY, b"1").await
        {
            tracing::debug!(target: "transfer::download", error = %e, "could not persist permission flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::infra::{DirectoryMediaLibrary, InMemoryBlobStore, InMemoryKeyValueStore};
    use bytes::Bytes;
    use chrono::Utc;
    use snapshare_model::{MediaId, NewMediaItem, RoomId};

    fn item(url: &str) -> MediaItem {
        NewMediaItem::new(RoomId::new(), url, "ana").persisted(MediaId::generate(), Utc::now())
    }

    #[tokio::test]
    async fn saves_available_items_and_skips_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(InMemoryBlobStore::default());
        blobs.insert("mem://blobs/a.jpg", Bytes::from_static(b"a"));
        blobs.insert("mem://blobs/b.png", Bytes::from_static(b"b"));
        let library = Arc::new(DirectoryMediaLibrary::new(dir.path().join("library")));
        let kv = Arc::new(InMemoryKeyValueStore::new());

        let coordinator = DownloadCoordinator::new(
            BlobTransferClient::new(blobs, TimeoutConfig::default()),
            library.clone(),
            DownloadConfig::default(),
        )
        .with_kv(kv);
        let report = coordinator
            .download_selection(&[
                item("mem://blobs/a.jpg"),
                item("mem://blobs/missing.jpg"),
                item("mem://blobs/b.png"),
            ])
            .await;

        assert_eq!(report, DownloadReport::saved(2, 1));
        assert!(report.success);
        assert_eq!(
            report.outcome(),
            BatchOutcome::PartiallySucceeded {
                completed: 2,
                failed: 1
            }
        );
        assert!(coordinator.permission_previously_requested().await);
        let saved = std::fs::read_dir(library.album_path("Snapshare")).unwrap().count();
        assert_eq!(saved, 2);

        let last = coordinator.watch_progress().borrow().clone().unwrap();
        assert_eq!(last.reported_progress, 1.0);
        assert_eq!(last.resolved(), 3);
    }

    #[tokio::test]
    async fn denied_permission_transfers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(DirectoryMediaLibrary::new(dir.path()));
        library.set_permission(false);

        let coordinator = DownloadCoordinator::new(
            BlobTransferClient::new(
                Arc::new(InMemoryBlobStore::default()),
                TimeoutConfig::default(),
            ),
            library,
            DownloadConfig::default(),
        );
        let report = coordinator.download_selection(&[item("mem://blobs/a.jpg")]).await;

        assert_eq!(
            report,
            DownloadReport {
                success: false,
                count: 0,
                failed: 0,
                permission_denied: true
            }
        );
        assert_eq!(report.outcome(), BatchOutcome::AllFailed);
        assert!(coordinator.watch_progress().borrow().is_none());
    }

    /// Library whose saves wait for permits handed out by the test.
    struct GatedLibrary {
        inner: DirectoryMediaLibrary,
        permits: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl MediaLibrary for GatedLibrary {
        async fn request_write_permission(&self) -> Result<crate::ports::PermissionStatus> {
            self.inner.request_write_permission().await
        }

        async fn save(&self, local_path: &Path, album: &str) -> Result<crate::ports::AssetRef> {
            self.permits.acquire().await.unwrap().forget();
            self.inner.save(local_path, album).await
        }
    }

    #[tokio::test]
    async fn overlapping_batches_run_one_after_another() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(InMemoryBlobStore::default());
        for name in ["a1", "a2", "b1"] {
            blobs.insert(format!("mem://blobs/{name}.jpg"), Bytes::from(name.to_string()));
        }
        let library = Arc::new(GatedLibrary {
            inner: DirectoryMediaLibrary::new(dir.path().join("library")),
            permits: tokio::sync::Semaphore::new(0),
        });
        let coordinator = DownloadCoordinator::new(
            BlobTransferClient::new(blobs, TimeoutConfig::default()),
            library.clone(),
            DownloadConfig::default(),
        );
        let progress = coordinator.watch_progress();

        let first = [item("mem://blobs/a1.jpg"), item("mem://blobs/a2.jpg")];
        let second = [item("mem://blobs/b1.jpg")];
        let (a, b, ()) = tokio::join!(
            coordinator.download_selection(&first),
            coordinator.download_selection(&second),
            async {
                let mut rx = progress.clone();
                rx.wait_for(|s| s.is_some()).await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                // The second batch has not replaced the first one's snapshot.
                assert_eq!(progress.borrow().as_ref().map(|s| s.total), Some(2));
                library.permits.add_permits(3);
            }
        );

        assert_eq!(a, DownloadReport::saved(2, 0));
        assert_eq!(b, DownloadReport::saved(1, 0));
        let last = progress.borrow().clone().unwrap();
        assert_eq!((last.total, last.completed), (1, 1));
    }
}
