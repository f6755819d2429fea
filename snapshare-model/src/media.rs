use std::cmp::Ordering;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{ModelError, Result};
use crate::ids::{MediaId, RoomId};

/// One shared photo, as persisted by the data service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaItem {
    pub id: MediaId,
    pub room_id: RoomId,
    /// Opaque blob-store locator.
    pub remote_url: String,
    /// Display name of the uploader.
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
}

impl MediaItem {
    /// Newest-first ordering used by room feeds. Ties on the timestamp fall
    /// back to the (time-ordered) server id so the order is total.
    pub fn feed_order(&self, other: &MediaItem) -> Ordering {
        other
            .uploaded_at
            .cmp(&self.uploaded_at)
            .then_with(|| other.id.cmp(&self.id))
    }

    pub fn is_uploaded_by(&self, name: &str) -> bool {
        self.uploaded_by == name
    }
}

/// A media record that has not been persisted yet and has no id.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewMediaItem {
    pub room_id: RoomId,
    pub remote_url: String,
    pub uploaded_by: String,
}

impl NewMediaItem {
    pub fn new(
        room_id: RoomId,
        remote_url: impl Into<String>,
        uploaded_by: impl Into<String>,
    ) -> Self {
        Self {
            room_id,
            remote_url: remote_url.into(),
            uploaded_by: uploaded_by.into(),
        }
    }

    /// Attach the server-assigned identity, producing a feed-eligible item.
    pub fn persisted(self, id: MediaId, uploaded_at: DateTime<Utc>) -> MediaItem {
        MediaItem {
            id,
            room_id: self.room_id,
            remote_url: self.remote_url,
            uploaded_by: self.uploaded_by,
            uploaded_at,
        }
    }
}

/// A time-boxed room as seen by the transfer core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoomContext {
    pub room_id: RoomId,
    /// Display name of the room creator.
    pub owner_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoomContext {
    pub fn new(room_id: RoomId, owner_name: impl Into<String>) -> Self {
        Self {
            room_id,
            owner_name: owner_name.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Local file handle queued for upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalFile(pub PathBuf);

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &std::path::Path {
        &self.0
    }

    /// Lower-cased extension, if the file name has one.
    pub fn extension(&self) -> Option<String> {
        self.0
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }
}

/// Extract the lower-cased file extension from a remote URL's path, if any.
pub fn remote_extension(remote_url: &str) -> Result<Option<String>> {
    let parsed = Url::parse(remote_url)
        .map_err(|e| ModelError::InvalidUrl(format!("{remote_url}: {e}")))?;
    let last = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    Ok(last
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5))
}
