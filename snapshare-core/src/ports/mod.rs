//! Collaborator contracts consumed by the transfer core.
//!
//! The concrete services (hosted database, object storage, on-device storage
//! and the device photo library) live behind these traits; `crate::infra`
//! ships in-memory and on-disk adapters.

pub mod blob_store;
pub mod data_service;
pub mod kv_store;
pub mod media_library;

pub use blob_store::{BlobStore, DeleteManyOutcome, PutOptions};
pub use data_service::{
    ChangeFeedStream, ChangeFeedSubscription, ChannelKey, DataService,
    FeedSignal, SubscriptionHandle,
};
pub use kv_store::KeyValueStore;
pub use media_library::{AssetRef, MediaLibrary, PermissionStatus};
