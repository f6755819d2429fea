use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        matches!(self, PermissionStatus::Granted)
    }
}

/// Reference to an asset saved into the device library.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetRef(pub String);

/// The device's photo library.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn request_write_permission(&self) -> Result<PermissionStatus>;

    /// Save a local file into `album`, creating the album on first use.
    async fn save(&self, local_path: &Path, album: &str) -> Result<AssetRef>;
}
