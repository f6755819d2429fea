use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use futures::future::ready;
use futures::stream;
use snapshare_model::{MediaId, MediaItem, NewMediaItem, RoomId, RoomMediaEvent};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::{Result, TransferError};
use crate::ports::{
    ChangeFeedSubscription, ChannelKey, DataService, FeedSignal,
    SubscriptionHandle,
};

const FEED_CAPACITY: usize = 256;

/// Data service holding room media in memory and broadcasting every change
/// to open subscriptions.
#[derive(Debug)]
pub struct InMemoryDataService {
    rooms: Mutex<HashMap<RoomId, Vec<MediaItem>>>,
    events: broadcast::Sender<RoomMediaEvent>,
    channels: DashMap<ChannelKey, SubscriptionHandle>,
    subscribe_calls: AtomicUsize,
}

impl Default for InMemoryDataService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDataService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            rooms: Mutex::new(HashMap::new()),
            events,
            channels: DashMap::new(),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    /// Number of `subscribe` calls served so far.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Channels currently open (one per channel key at most).
    pub fn open_channels(&self) -> usize {
        self.channels
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    /// Push an event to subscribers without touching stored records, e.g. to
    /// replay a stale or duplicate delivery.
    pub fn emit(&self, event: RoomMediaEvent) {
        let _ = self.events.send(event);
    }

    fn with_rooms<T>(
        &self,
        f: impl FnOnce(&mut HashMap<RoomId, Vec<MediaItem>>) -> T,
    ) -> Result<T> {
        let mut guard = self
            .rooms
            .lock()
            .map_err(|_| TransferError::Service("room table poisoned".into()))?;
        Ok(f(&mut guard))
    }

    fn remove_record(&self, id: MediaId) -> Result<Option<MediaItem>> {
        self.with_rooms(|rooms| {
            rooms.values_mut().find_map(|items| {
                let pos = items.iter().position(|item| item.id == id)?;
                Some(items.remove(pos))
            })
        })
    }
}

#[async_trait]
impl DataService for InMemoryDataService {
    async fn list_media(&self, room_id: RoomId) -> Result<Vec<MediaItem>> {
        self.with_rooms(|rooms| {
            let mut items = rooms.get(&room_id).cloned().unwrap_or_default();
            items.sort_by(MediaItem::feed_order);
            items
        })
    }

    async fn insert_media(&self, item: NewMediaItem) -> Result<MediaItem> {
        let persisted = item.persisted(MediaId::generate(), Utc::now());
        self.with_rooms(|rooms| {
            rooms
                .entry(persisted.room_id)
                .or_default()
                .push(persisted.clone());
        })?;
        self.emit(RoomMediaEvent::Inserted {
            item: persisted.clone(),
        });
        Ok(persisted)
    }

    async fn delete_media(&self, id: MediaId, actor: &str) -> Result<bool> {
        match self.remove_record(id)? {
            Some(removed) => {
                self.emit(RoomMediaEvent::Deleted {
                    room_id: removed.room_id,
                    id,
                    deleted_by: Some(actor.to_string()),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_media_many(
        &self,
        ids: &[MediaId],
        actor: &str,
    ) -> Result<bool> {
        let mut any = false;
        for id in ids {
            any |= self.delete_media(*id, actor).await?;
        }
        Ok(any)
    }

    async fn subscribe(
        &self,
        channel: &ChannelKey,
    ) -> Result<ChangeFeedSubscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let handle = SubscriptionHandle::new();
        if let Some(previous) =
            self.channels.insert(channel.clone(), handle.clone())
        {
            previous.close();
        }

        let room_id = channel.room_id;
        let events = BroadcastStream::new(self.events.subscribe()).filter_map(
            move |received| {
                let signal = match received {
                    Ok(event) if event.room_id() == room_id => {
                        Some(FeedSignal::Event(event))
                    }
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        Some(FeedSignal::Error(format!(
                            "change feed lagged, {skipped} events skipped"
                        )))
                    }
                };
                ready(signal)
            },
        );
        let signals = stream::once(ready(FeedSignal::Subscribed))
            .chain(events)
            .take_until(handle.token().cancelled_owned())
            .boxed();

        Ok(ChangeFeedSubscription { signals, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_id_and_lists_newest_first() {
        let svc = InMemoryDataService::new();
        let room = RoomId::new();
        let a = svc
            .insert_media(NewMediaItem::new(room, "mem://a.jpg", "ana"))
            .await
            .unwrap();
        let b = svc
            .insert_media(NewMediaItem::new(room, "mem://b.jpg", "ben"))
            .await
            .unwrap();
        let listed = svc.list_media(room).await.unwrap();
        assert_eq!(listed.first().map(|i| i.id), Some(b.id));
        assert_eq!(listed.last().map(|i| i.id), Some(a.id));
    }

    #[tokio::test]
    async fn subscription_sees_only_its_room() {
        let svc = InMemoryDataService::new();
        let room = RoomId::new();
        let other = RoomId::new();
        let mut sub = svc.subscribe(&ChannelKey::new(room, "ana")).await.unwrap();
        assert_eq!(sub.signals.next().await, Some(FeedSignal::Subscribed));

        svc.insert_media(NewMediaItem::new(other, "mem://x.jpg", "zed"))
            .await
            .unwrap();
        let mine = svc
            .insert_media(NewMediaItem::new(room, "mem://y.jpg", "ana"))
            .await
            .unwrap();

        match sub.signals.next().await {
            Some(FeedSignal::Event(RoomMediaEvent::Inserted { item })) => {
                assert_eq!(item.id, mine.id)
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn resubscribing_same_channel_closes_previous() {
        let svc = InMemoryDataService::new();
        let key = ChannelKey::new(RoomId::new(), "ana");
        let first = svc.subscribe(&key).await.unwrap();
        let _second = svc.subscribe(&key).await.unwrap();
        assert!(first.handle.is_closed());
        assert_eq!(svc.open_channels(), 1);
    }

    #[tokio::test]
    async fn delete_reports_actor_and_absence() {
        let svc = InMemoryDataService::new();
        let room = RoomId::new();
        let mut sub = svc.subscribe(&ChannelKey::new(room, "ana")).await.unwrap();
        let _ = sub.signals.next().await;
        let item = svc
            .insert_media(NewMediaItem::new(room, "mem://a.jpg", "ana"))
            .await
            .unwrap();
        let _ = sub.signals.next().await;

        assert!(svc.delete_media(item.id, "owner").await.unwrap());
        assert!(!svc.delete_media(item.id, "owner").await.unwrap());
        match sub.signals.next().await {
            Some(FeedSignal::Event(RoomMediaEvent::Deleted {
                deleted_by, ..
            })) => assert_eq!(deleted_by.as_deref(), Some("owner")),
            other => panic!("unexpected signal {other:?}"),
        }
    }
}
