use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, TransferError};
use crate::ports::{AssetRef, MediaLibrary, PermissionStatus};

/// Device library stand-in that files assets under `<root>/<album>/`.
///
/// Albums are created on first save and reused afterwards. Whether write
/// permission is granted is a runtime switch so callers can model a user
/// declining the prompt.
#[derive(Debug)]
pub struct DirectoryMediaLibrary {
    root: PathBuf,
    grant: AtomicBool,
    permission_requests: AtomicUsize,
}

impl DirectoryMediaLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            grant: AtomicBool::new(true),
            permission_requests: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.grant.store(granted, Ordering::SeqCst);
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    pub fn album_path(&self, album: &str) -> PathBuf {
        self.root.join(sanitize_album(album))
    }
}

fn sanitize_album(album: &str) -> String {
    let cleaned: String = album
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '.' { '_' } else { c })
        .collect();
    if cleaned.trim().is_empty() {
        "Untitled".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl MediaLibrary for DirectoryMediaLibrary {
    async fn request_write_permission(&self) -> Result<PermissionStatus> {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        Ok(if self.grant.load(Ordering::SeqCst) {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        })
    }

    async fn save(&self, local_path: &Path, album: &str) -> Result<AssetRef> {
        if !self.grant.load(Ordering::SeqCst) {
            return Err(TransferError::Permission(
                "media library write access revoked".into(),
            ));
        }

        let album_dir = self.album_path(album);
        if !tokio::fs::try_exists(&album_dir).await? {
            tokio::fs::create_dir_all(&album_dir).await?;
            tracing::debug!(target: "transfer::download", album = %album_dir.display(), "created album");
        }

        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("photo");
        let mut target = album_dir.join(file_name);
        if tokio::fs::try_exists(&target).await? {
            target = album_dir.join(format!("{}-{}", Uuid::new_v4().simple(), file_name));
        }

        tokio::fs::copy(local_path, &target).await?;
        Ok(AssetRef(target.to_string_lossy().into_owned()))
    }
}
