//! Test data builders.

use std::path::Path;
use std::sync::Arc;

use snapshare_core::SessionDeps;
use snapshare_core::config::TransferConfig;
use snapshare_core::infra::{DirectoryMediaLibrary, InMemoryKeyValueStore};
use snapshare_core::ports::{BlobStore, DataService};
use snapshare_model::LocalFile;

/// Contents of the `i`th photo written by [`write_photos`].
pub fn photo_bytes(i: usize) -> Vec<u8> {
    format!("photo-{i}").into_bytes()
}

/// Write `n` small files with distinct contents.
pub async fn write_photos(dir: &Path, n: usize) -> Vec<LocalFile> {
    let mut files = Vec::with_capacity(n);
    for i in 0..n {
        let path = dir.join(format!("IMG_{i:04}.jpg"));
        tokio::fs::write(&path, photo_bytes(i))
            .await
            .expect("write test photo");
        files.push(LocalFile::new(path));
    }
    files
}

/// Config with the cache rooted in `dir`.
pub fn config_in(dir: &Path) -> TransferConfig {
    let mut config = TransferConfig::default();
    config.cache.directory = Some(dir.join("cache"));
    config
}

pub fn deps(
    data: Arc<dyn DataService>,
    blobs: Arc<dyn BlobStore>,
    library: Arc<DirectoryMediaLibrary>,
) -> SessionDeps {
    SessionDeps {
        data,
        blobs,
        kv: Arc::new(InMemoryKeyValueStore::new()),
        library,
    }
}
