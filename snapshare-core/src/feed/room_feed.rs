use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use snapshare_model::{MediaId, MediaItem, RoomContext, RoomMediaEvent};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::PreloadConfig;
use crate::error::{Result, TransferError};
use crate::feed::state::{FeedPhase, LoadTicket, RemoteChange, RoomFeedState};
use crate::feed::subscription::FeedEventSink;
use crate::local_cache::LocalCacheStore;
use crate::ports::DataService;
use crate::transfer::BlobTransferClient;

const NOTICE_CAPACITY: usize = 32;

/// What the UI renders for the open room.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedSnapshot {
    pub phase: FeedPhase,
    pub items: Vec<MediaItem>,
}

/// Transient notifications for the UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedNotice {
    /// Someone other than the local user removed an item.
    RemovedByOther {
        media_id: MediaId,
        actor_label: String,
    },
}

impl FeedNotice {
    pub fn message(&self) -> String {
        match self {
            FeedNotice::RemovedByOther { actor_label, .. } => {
                format!("A photo was removed by {actor_label}")
            }
        }
    }
}

struct Preloader {
    cache: Arc<LocalCacheStore>,
    client: BlobTransferClient,
    config: PreloadConfig,
}

struct FeedInner {
    room: RoomContext,
    local_user: String,
    data: Arc<dyn DataService>,
    state: Mutex<RoomFeedState>,
    snapshots: watch::Sender<FeedSnapshot>,
    notices: broadcast::Sender<FeedNotice>,
    preloader: Option<Preloader>,
    preload_task: Mutex<Option<JoinHandle<()>>>,
}

/// Authoritative media list for the open room.
///
/// Every mutation takes the state lock, applies itself and publishes a
/// snapshot before releasing it, so mutations never interleave and
/// subscribers observe them in application order.
#[derive(Clone)]
pub struct RoomMediaFeed {
    inner: Arc<FeedInner>,
}

impl fmt::Debug for RoomMediaFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomMediaFeed")
            .field("room_id", &self.inner.room.room_id)
            .field("local_user", &self.inner.local_user)
            .finish_non_exhaustive()
    }
}

impl RoomMediaFeed {
    pub fn new(
        room: RoomContext,
        local_user: impl Into<String>,
        data: Arc<dyn DataService>,
    ) -> Self {
        Self::build(room, local_user.into(), data, None)
    }

    /// A feed that warms `cache` with the listed URLs after each load.
    pub fn with_preload(
        room: RoomContext,
        local_user: impl Into<String>,
        data: Arc<dyn DataService>,
        cache: Arc<LocalCacheStore>,
        client: BlobTransferClient,
        config: PreloadConfig,
    ) -> Self {
        let preloader = Preloader {
            cache,
            client,
            config,
        };
        Self::build(room, local_user.into(), data, Some(preloader))
    }

    fn build(
        room: RoomContext,
        local_user: String,
        data: Arc<dyn DataService>,
        preloader: Option<Preloader>,
    ) -> Self {
        let state = RoomFeedState::new(room.room_id);
        let (snapshots, _) = watch::channel(snapshot_of(&state));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(FeedInner {
                room,
                local_user,
                data,
                state: Mutex::new(state),
                snapshots,
                notices,
                preloader,
                preload_task: Mutex::new(None),
            }),
        }
    }

    pub fn room(&self) -> &RoomContext {
        &self.inner.room
    }

    pub fn local_user(&self) -> &str {
        &self.inner.local_user
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn items(&self) -> Vec<MediaItem> {
        self.inner.snapshots.borrow().items.clone()
    }

    pub fn phase(&self) -> FeedPhase {
        self.inner.snapshots.borrow().phase.clone()
    }

    pub fn contains(&self, id: MediaId) -> bool {
        self.inner
            .snapshots
            .borrow()
            .items
            .iter()
            .any(|item| item.id == id)
    }

    /// Whether `id` is hidden by an unconfirmed local delete.
    pub fn is_pending_removal(&self, id: MediaId) -> bool {
        self.lock_state()
            .map(|state| state.is_pending_removal(id))
            .unwrap_or(false)
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<FeedSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<FeedNotice> {
        self.inner.notices.subscribe()
    }

    /// Fetch the full list and replace local state with it. Changes applied
    /// while the request is in flight are kept on top of the listing, and
    /// unconfirmed local operations are replayed.
    ///
    /// On failure the feed stays in `Loading` with the error recorded; there
    /// is no automatic retry.
    pub async fn load(&self) -> Result<()> {
        let room_id = self.inner.room.room_id;
        let ticket = self.lock_state()?.begin_load();
        let in_flight = LoadInFlight {
            feed: self,
            ticket: Some(ticket),
        };
        let listing = self.inner.data.list_media(room_id).await;
        in_flight.disarm();

        match listing {
            Ok(listing) => {
                let count = listing.len();
                if !self.mutate(|state| state.replace_with_server(listing, ticket))? {
                    tracing::debug!(target: "feed", %room_id, "dropped superseded listing");
                    return Ok(());
                }
                tracing::info!(target: "feed", %room_id, count, "room feed loaded");
                self.start_preload()?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(target: "feed", %room_id, error = %e, "room feed load failed");
                self.mutate(|state| state.mark_load_failed(ticket, e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Manual refresh.
    pub async fn reload(&self) -> Result<()> {
        self.load().await
    }

    /// Optimistically add an item persisted by this client.
    pub fn apply_local_insert(&self, item: MediaItem) -> Result<bool> {
        self.mutate(|state| state.apply_local_insert(item))
    }

    /// Optimistically remove items, returning those that were listed.
    pub fn apply_local_remove(&self, ids: &[MediaId]) -> Result<Vec<MediaItem>> {
        self.mutate(|state| state.apply_local_remove(ids))
    }

    /// Apply one change-feed event.
    pub fn apply_remote_event(&self, event: &RoomMediaEvent) -> Result<RemoteChange> {
        let change = self.mutate(|state| state.apply_remote(event))?;
        if let (
            RemoteChange::Removed(item),
            RoomMediaEvent::Deleted { deleted_by, .. },
        ) = (&change, event)
            && deleted_by.as_deref() != Some(self.inner.local_user.as_str())
        {
            let notice = FeedNotice::RemovedByOther {
                media_id: item.id,
                actor_label: self.actor_label(deleted_by.as_deref()),
            };
            tracing::debug!(target: "feed", media_id = %item.id, "{}", notice.message());
            // No receivers is fine.
            let _ = self.inner.notices.send(notice);
        }
        Ok(change)
    }

    /// Optimistically remove `ids`, then confirm the delete with the data
    /// service. If confirmation fails, the removal is rolled back by
    /// reloading server state and the original error is returned.
    pub async fn delete_items(&self, ids: &[MediaId]) -> Result<Vec<MediaItem>> {
        let removed = self.apply_local_remove(ids)?;
        match self
            .inner
            .data
            .delete_media_many(ids, &self.inner.local_user)
            .await
        {
            Ok(_) => Ok(removed),
            Err(e) => {
                tracing::warn!(
                    target: "feed",
                    room_id = %self.inner.room.room_id,
                    count = ids.len(),
                    error = %e,
                    "delete confirmation failed, resynchronizing"
                );
                self.mutate(|state| state.cancel_removals(ids))?;
                if let Err(reload_err) = self.load().await {
                    tracing::warn!(target: "feed", error = %reload_err, "resynchronization failed");
                }
                Err(e)
            }
        }
    }

    /// Wait for the current background preload, if any, to finish.
    pub async fn preload_idle(&self) {
        let task = match self.inner.preload_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Stop background work and drop the room's state.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.inner.preload_task.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
        if let Err(e) = self.mutate(RoomFeedState::clear) {
            tracing::warn!(target: "feed", error = %e, "failed to clear feed state");
        }
    }

    fn actor_label(&self, actor: Option<&str>) -> String {
        match actor {
            Some(actor) if actor == self.inner.room.owner_name => {
                "the room owner".to_string()
            }
            Some(actor) => actor.to_string(),
            None => "someone".to_string(),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, RoomFeedState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| TransferError::Internal("room feed state poisoned".into()))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut RoomFeedState) -> T) -> Result<T> {
        let mut state = self.lock_state()?;
        let out = f(&mut state);
        self.inner.snapshots.send_replace(snapshot_of(&state));
        Ok(out)
    }

    fn start_preload(&self) -> Result<()> {
        let Some(preloader) = &self.inner.preloader else {
            return Ok(());
        };
        let mut priority: Vec<String> = self
            .lock_state()?
            .items()
            .iter()
            .map(|item| item.remote_url.clone())
            .collect();
        let rest =
            priority.split_off(preloader.config.priority_count.min(priority.len()));
        let cache = Arc::clone(&preloader.cache);
        let client = preloader.client.clone();
        let concurrency = preloader.config.priority_concurrency.max(1);

        let task = tokio::spawn(async move {
            stream::iter(priority)
                .map(|url| {
                    let cache = Arc::clone(&cache);
                    let client = client.clone();
                    async move { warm(&cache, &client, &url).await }
                })
                .buffer_unordered(concurrency)
                .collect::<Vec<()>>()
                .await;

            for url in rest {
                warm(&cache, &client, &url).await;
                tokio::task::yield_now().await;
            }
        });

        let mut guard = self
            .inner
            .preload_task
            .lock()
            .map_err(|_| TransferError::Internal("preload slot poisoned".into()))?;
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

/// Releases the load ticket if `load` is dropped mid-request.
struct LoadInFlight<'a> {
    feed: &'a RoomMediaFeed,
    ticket: Option<LoadTicket>,
}

impl LoadInFlight<'_> {
    fn disarm(mut self) {
        self.ticket = None;
    }
}

impl Drop for LoadInFlight<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take()
            && let Ok(mut state) = self.feed.lock_state()
        {
            state.abandon_load(ticket);
        }
    }
}

async fn warm(cache: &LocalCacheStore, client: &BlobTransferClient, url: &str) {
    if let Err(e) = cache.cache_remote(url, client).await {
        tracing::debug!(target: "feed", url = %url, error = %e, "preload skipped");
    }
}

fn snapshot_of(state: &RoomFeedState) -> FeedSnapshot {
    FeedSnapshot {
        phase: state.phase().clone(),
        items: state.items().to_vec(),
    }
}

#[async_trait]
impl FeedEventSink for RoomMediaFeed {
    fn on_event(&self, event: RoomMediaEvent) {
        if let Err(e) = self.apply_remote_event(&event) {
            tracing::error!(target: "feed", error = %e, "failed to apply change-feed event");
        }
    }

    async fn on_resubscribed(&self) {
        if let Err(e) = self.reload().await {
            tracing::warn!(target: "feed", error = %e, "reload after reconnect failed");
        }
    }
}
