//! Core data model definitions shared across Snapshare crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod events;
pub mod ids;
pub mod media;

pub use error::{ModelError, Result as ModelResult};
pub use events::RoomMediaEvent;
pub use ids::{MediaId, RoomId};
pub use media::{LocalFile, MediaItem, NewMediaItem, RoomContext, remote_extension};
