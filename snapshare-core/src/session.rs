//! One open room: the feed, its live subscription and the transfer
//! coordinators, wired to the same collaborators.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use snapshare_model::{LocalFile, MediaId, MediaItem, RoomContext};

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::feed::{ChangeFeedManager, RoomMediaFeed, SubscriptionState};
use crate::local_cache::LocalCacheStore;
use crate::ports::{BlobStore, ChannelKey, DataService, KeyValueStore, MediaLibrary};
use crate::transfer::{
    BatchHandle, BlobTransferClient, DownloadCoordinator, DownloadReport, UploadContext,
    UploadCoordinator,
};

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub data: Arc<dyn DataService>,
    pub blobs: Arc<dyn BlobStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub library: Arc<dyn MediaLibrary>,
}

impl fmt::Debug for SessionDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDeps").finish_non_exhaustive()
    }
}

pub struct RoomSession {
    room: RoomContext,
    user: String,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<LocalCacheStore>,
    feed: RoomMediaFeed,
    subscription: ChangeFeedManager,
    uploads: UploadCoordinator,
    downloads: DownloadCoordinator,
    exited: AtomicBool,
}

impl fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomSession")
            .field("room", &self.room)
            .field("user", &self.user)
            .field("subscription", &self.subscription.state())
            .finish_non_exhaustive()
    }
}

impl RoomSession {
    /// Open `room` for `user`: load the feed, start preloading and subscribe
    /// to changes.
    ///
    /// A failed initial load does not fail the session; the feed stays in
    /// `Loading` with the error and [`RoomSession::refresh`] retries it.
    pub async fn enter(
        room: RoomContext,
        user: impl Into<String>,
        deps: SessionDeps,
        config: &TransferConfig,
    ) -> Result<Self> {
        let user = user.into();
        let client = BlobTransferClient::new(Arc::clone(&deps.blobs), config.timeouts);

        let cache_dir = config
            .cache
            .directory
            .clone()
            .unwrap_or_else(default_cache_dir);
        let cache = Arc::new(
            LocalCacheStore::open(cache_dir, config.cache.ttl(), Arc::clone(&deps.kv)).await?,
        );
        if let Err(e) = cache.sweep_expired().await {
            tracing::warn!(target: "transfer::cache", error = %e, "cache sweep failed");
        }

        let feed = RoomMediaFeed::with_preload(
            room.clone(),
            user.clone(),
            Arc::clone(&deps.data),
            Arc::clone(&cache),
            client.clone(),
            config.preload,
        );
        if let Err(e) = feed.load().await {
            tracing::warn!(target: "feed", room_id = %room.room_id, error = %e, "entered room without media, refresh to retry");
        }

        let subscription = ChangeFeedManager::new(
            Arc::clone(&deps.data),
            ChannelKey::new(room.room_id, user.clone()),
            config.subscription,
        );
        subscription.start(Arc::new(feed.clone()));

        let uploads = UploadCoordinator::new(
            client.clone(),
            Arc::clone(&deps.data),
            config.upload.clone(),
        )
        .with_cache(Arc::clone(&cache));
        let downloads = DownloadCoordinator::new(client, deps.library, config.download.clone())
            .with_cache(Arc::clone(&cache))
            .with_kv(deps.kv);

        tracing::info!(target: "feed", room_id = %room.room_id, user = %user, "entered room");
        Ok(Self {
            room,
            user,
            blobs: deps.blobs,
            cache,
            feed,
            subscription,
            uploads,
            downloads,
            exited: AtomicBool::new(false),
        })
    }

    pub fn room(&self) -> &RoomContext {
        &self.room
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn feed(&self) -> &RoomMediaFeed {
        &self.feed
    }

    pub fn cache(&self) -> &Arc<LocalCacheStore> {
        &self.cache
    }

    pub fn subscription(&self) -> &ChangeFeedManager {
        &self.subscription
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn is_owner(&self) -> bool {
        self.room.owner_name == self.user
    }

    /// Start uploading `files` into the room.
    pub fn upload(&self, files: Vec<LocalFile>) -> Result<BatchHandle> {
        self.ensure_open()?;
        if self.room.is_expired_at(Utc::now()) {
            return Err(TransferError::Permission("room has expired".into()));
        }
        let ctx = UploadContext::new(self.room.room_id, self.user.clone())
            .with_feed(self.feed.clone());
        Ok(self.uploads.submit_batch(files, ctx))
    }

    /// Everything in the feed not uploaded by this user.
    pub fn default_download_selection(&self) -> Vec<MediaItem> {
        self.feed
            .items()
            .into_iter()
            .filter(|item| !item.is_uploaded_by(&self.user))
            .collect()
    }

    /// Save `selection`, or the default selection when `None`, into the
    /// device library.
    pub async fn download(&self, selection: Option<Vec<MediaItem>>) -> DownloadReport {
        let items = selection.unwrap_or_else(|| self.default_download_selection());
        self.downloads.download_selection(&items).await
    }

    pub fn downloads(&self) -> &DownloadCoordinator {
        &self.downloads
    }

    /// Delete media on behalf of the user. Only an item's uploader or the
    /// room owner may delete it; the whole request is rejected otherwise.
    ///
    /// Returns how many items were removed from the feed.
    pub async fn delete_media(&self, ids: &[MediaId]) -> Result<usize> {
        self.ensure_open()?;
        let items = self.feed.items();
        let requested: HashSet<MediaId> = ids.iter().copied().collect();
        let targets: Vec<&MediaItem> = items
            .iter()
            .filter(|item| requested.contains(&item.id))
            .collect();
        if targets.len() != requested.len() {
            return Err(TransferError::NotFound(
                "some media is no longer in this room".into(),
            ));
        }
        if !self.is_owner()
            && let Some(foreign) = targets.iter().find(|item| !item.is_uploaded_by(&self.user))
        {
            return Err(TransferError::Permission(format!(
                "{} cannot delete media uploaded by {}",
                self.user, foreign.uploaded_by
            )));
        }

        let ids: Vec<MediaId> = requested.into_iter().collect();
        let removed = self.feed.delete_items(&ids).await?;

        let urls: Vec<String> = removed.iter().map(|item| item.remote_url.clone()).collect();
        match self.blobs.delete_many(&urls).await {
            Ok(outcome) => {
                tracing::debug!(target: "feed", requested = urls.len(), deleted = outcome.deleted_count, "deleted blobs");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(target: "feed", error = %e, "blob cleanup failed");
            }
        }
        for url in &urls {
            if let Err(e) = self.cache.invalidate(url).await {
                tracing::debug!(target: "transfer::cache", url = %url, error = %e, "cache invalidation failed");
            }
        }
        Ok(removed.len())
    }

    /// Manual refresh of the feed.
    pub async fn refresh(&self) -> Result<()> {
        self.ensure_open()?;
        self.feed.reload().await
    }

    /// Leave the room. Safe to call more than once.
    pub fn exit(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        self.subscription.stop();
        self.feed.shutdown();
        tracing::info!(target: "feed", room_id = %self.room.room_id, "left room");
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_exited() {
            return Err(TransferError::Internal("room session has been exited".into()));
        }
        Ok(())
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.exit();
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("snapshare").join("media-cache")
}
