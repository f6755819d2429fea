use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use snapshare_model::{MediaId, MediaItem, NewMediaItem, RoomId, RoomMediaEvent};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Stable identity of a change-feed channel: one per (room, user), so
/// re-subscribing never creates a second channel for the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub room_id: RoomId,
    pub user: String,
}

impl ChannelKey {
    pub fn new(room_id: RoomId, user: impl Into<String>) -> Self {
        Self {
            room_id,
            user: user.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room-media:{}:{}", self.room_id, self.user)
    }
}

/// Everything a live subscription can report.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Subscribed,
    Event(RoomMediaEvent),
    Error(String),
    TimedOut,
    Closed,
}

pub type ChangeFeedStream = BoxStream<'static, FeedSignal>;

/// Closes a subscription. Closing twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token adapters watch to end their stream.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

pub struct ChangeFeedSubscription {
    pub signals: ChangeFeedStream,
    pub handle: SubscriptionHandle,
}

impl fmt::Debug for ChangeFeedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeedSubscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Hosted record store for room media plus its change feed.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn list_media(&self, room_id: RoomId) -> Result<Vec<MediaItem>>;

    /// Persist a record; the service assigns id and timestamp.
    async fn insert_media(&self, item: NewMediaItem) -> Result<MediaItem>;

    /// Delete one record on behalf of `actor`. Returns `true` if it existed.
    async fn delete_media(&self, id: MediaId, actor: &str) -> Result<bool>;

    async fn delete_media_many(
        &self,
        ids: &[MediaId],
        actor: &str,
    ) -> Result<bool>;

    async fn subscribe(
        &self,
        channel: &ChannelKey,
    ) -> Result<ChangeFeedSubscription>;
}
