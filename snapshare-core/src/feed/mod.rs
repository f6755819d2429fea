//! The room media feed and the live subscription that keeps it current.

pub mod room_feed;
pub mod state;
pub mod subscription;

pub use room_feed::{FeedNotice, FeedSnapshot, RoomMediaFeed};
pub use state::{FeedPhase, LoadTicket, PendingOp, RemoteChange, RoomFeedState};
pub use subscription::{ChangeFeedManager, FeedEventSink, SubscriptionState};
