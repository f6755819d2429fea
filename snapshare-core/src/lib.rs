//! # Snapshare Core
//!
//! Transfer subsystem for Snapshare rooms: moves batches of photos between
//! the device and remote storage over unreliable networks, keeps a local
//! cache of what has been fetched, and maintains a consistent view of a
//! room's media while a live change feed races with local edits.
//!
//! ## Architecture
//!
//! - [`transfer`]: the single-item [`BlobTransferClient`] plus the batch
//!   [`UploadCoordinator`] and [`DownloadCoordinator`]
//! - [`local_cache`]: URL-keyed cache of downloaded and uploaded files
//! - [`feed`]: the [`RoomMediaFeed`] and the [`ChangeFeedManager`] that keeps
//!   it live
//! - [`session`]: [`RoomSession`] wiring everything together for one room
//! - [`ports`]: collaborator traits (data service, blob store, key-value
//!   store, device library) and [`infra`] adapters for them
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use snapshare_core::infra::{
//!     DirectoryMediaLibrary, InMemoryBlobStore, InMemoryDataService, InMemoryKeyValueStore,
//! };
//! use snapshare_core::{RoomSession, SessionDeps, TransferConfig};
//! use snapshare_model::{LocalFile, RoomContext, RoomId};
//!
//! async fn share(files: Vec<LocalFile>) -> snapshare_core::Result<()> {
//!     let deps = SessionDeps {
//!         data: Arc::new(InMemoryDataService::new()),
//!         blobs: Arc::new(InMemoryBlobStore::default()),
//!         kv: Arc::new(InMemoryKeyValueStore::new()),
//!         library: Arc::new(DirectoryMediaLibrary::new("/tmp/library")),
//!     };
//!     let room = RoomContext::new(RoomId::new(), "olive");
//!     let session = RoomSession::enter(room, "olive", deps, &TransferConfig::default()).await?;
//!
//!     let report = session.upload(files)?.wait().await?;
//!     println!("{:?}", report.outcome);
//!     session.exit();
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Layered configuration (defaults, TOML, environment)
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Room media feed and change-feed subscription
pub mod feed;

/// Adapters implementing the collaborator ports
pub mod infra;

/// Local cache of remote media files
pub mod local_cache;

/// Collaborator contracts
pub mod ports;

/// Open-room session wiring
pub mod session;

/// Tracing setup
pub mod telemetry;

/// Single and batch blob transfers
pub mod transfer;

pub use config::TransferConfig;
pub use error::{Result, TransferError};
pub use feed::{
    ChangeFeedManager, FeedNotice, FeedPhase, RoomMediaFeed, SubscriptionState,
};
pub use local_cache::{CacheEntry, LocalCacheStore};
pub use session::{RoomSession, SessionDeps};
pub use transfer::{
    BatchHandle, BatchOutcome, BatchReport, BatchSnapshot, BlobTransferClient,
    DownloadCoordinator, DownloadReport, UploadContext, UploadCoordinator,
};
