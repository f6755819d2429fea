//! Fault-injecting collaborators wrapping the in-memory adapters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use snapshare_core::error::{Result, TransferError};
use snapshare_core::infra::{InMemoryBlobStore, InMemoryDataService};
use snapshare_core::ports::{
    BlobStore, ChangeFeedSubscription, ChannelKey, DataService, DeleteManyOutcome, PutOptions,
};
use snapshare_model::{MediaId, MediaItem, NewMediaItem, RoomId};
use tokio::sync::Notify;

/// Blob store that fails `put` a scripted number of times per payload.
///
/// Payloads are matched by their exact bytes, so each test file should have
/// distinct contents.
#[derive(Debug, Default)]
pub struct FlakyBlobStore {
    pub inner: InMemoryBlobStore,
    put_failures: Mutex<HashMap<Vec<u8>, u32>>,
    pub put_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub deleted: Mutex<Vec<String>>,
}

impl FlakyBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` uploads of `payload` with a network error.
    pub fn fail_put(&self, payload: impl AsRef<[u8]>, times: u32) {
        self.put_failures
            .lock()
            .unwrap()
            .insert(payload.as_ref().to_vec(), times);
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, data: Bytes, options: &PutOptions) -> Result<String> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.put_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(data.as_ref())
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(TransferError::Network("connection reset".into()));
            }
        }
        self.inner.put(data, options).await
    }

    async fn get(&self, url: &str) -> Result<Bytes> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get(url).await
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        self.deleted.lock().unwrap().push(url.to_string());
        self.inner.delete(url).await
    }

    async fn delete_many(&self, urls: &[String]) -> Result<DeleteManyOutcome> {
        self.deleted.lock().unwrap().extend(urls.iter().cloned());
        self.inner.delete_many(urls).await
    }
}

/// Data service with switchable failures on top of the in-memory one.
#[derive(Debug, Default)]
pub struct FlakyDataService {
    pub inner: InMemoryDataService,
    insert_failures: AtomicU32,
    subscribe_failures: AtomicU32,
    fail_list: AtomicBool,
    fail_deletes: AtomicBool,
    list_hold: Mutex<Option<Arc<Notify>>>,
    pub subscribe_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl FlakyDataService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` record inserts with a service error.
    pub fn fail_inserts(&self, times: u32) {
        self.insert_failures.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` subscribe calls with a network error.
    pub fn fail_subscribes(&self, times: u32) {
        self.subscribe_failures.store(times, Ordering::SeqCst);
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `list_media` capture its listing, then wait for the
    /// returned notify before answering.
    pub fn hold_next_list(&self) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.list_hold.lock().unwrap() = Some(release.clone());
        release
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DataService for FlakyDataService {
    async fn list_media(&self, room_id: RoomId) -> Result<Vec<MediaItem>> {
        if self.fail_list.load(Ordering::SeqCst) {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            return Err(TransferError::Network("list timed out".into()));
        }
        let listing = self.inner.list_media(room_id).await;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.list_hold.lock().unwrap().take();
        if let Some(release) = hold {
            release.notified().await;
        }
        listing
    }

    async fn insert_media(&self, item: NewMediaItem) -> Result<MediaItem> {
        if Self::take_failure(&self.insert_failures) {
            return Err(TransferError::Service("insert rejected".into()));
        }
        self.inner.insert_media(item).await
    }

    async fn delete_media(&self, id: MediaId, actor: &str) -> Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(TransferError::Service("delete rejected".into()));
        }
        self.inner.delete_media(id, actor).await
    }

    async fn delete_media_many(&self, ids: &[MediaId], actor: &str) -> Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(TransferError::Service("delete rejected".into()));
        }
        self.inner.delete_media_many(ids, actor).await
    }

    async fn subscribe(&self, channel: &ChannelKey) -> Result<ChangeFeedSubscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.subscribe_failures) {
            return Err(TransferError::Network("realtime socket refused".into()));
        }
        self.inner.subscribe(channel).await
    }
}
