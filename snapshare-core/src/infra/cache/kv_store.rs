use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use crate::error::{Result, TransferError};
use crate::ports::KeyValueStore;

/// Root directory that `cacache` manages (index + content-addressed blobs).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KvCacheRoot(PathBuf);

impl KvCacheRoot {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for KvCacheRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KvCacheRoot").field(&self.0).finish()
    }
}

/// Persistent key-value store on top of `cacache`.
#[derive(Clone, Debug)]
pub struct CacacheKeyValueStore {
    root: KvCacheRoot,
}

impl CacacheKeyValueStore {
    pub fn new(root: KvCacheRoot) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &KvCacheRoot {
        &self.root
    }
}

fn map_cacache_error(key: &str, e: cacache::Error) -> TransferError {
    match e {
        cacache::Error::IntegrityError(err) => TransferError::Cache(format!(
            "entry failed integrity check: {key} ({err})"
        )),
        cacache::Error::SizeMismatch(wanted, actual) => {
            TransferError::Cache(format!(
                "entry size mismatch: key={key}, wanted={wanted}, actual={actual}"
            ))
        }
        cacache::Error::IoError(_, msg) => {
            TransferError::Cache(format!("cacache I/O error: {msg}"))
        }
        cacache::Error::SerdeError(_, msg) => {
            TransferError::Cache(format!("cacache serde error: {msg}"))
        }
        other => TransferError::Cache(format!("cacache error for {key}: {other}")),
    }
}

#[async_trait]
impl KeyValueStore for CacacheKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match cacache::read(self.root.as_path(), key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(e) => Err(map_cacache_error(key, e)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        cacache::write(self.root.as_path(), key, value)
            .await
            .map(|_integrity| ())
            .map_err(|e| map_cacache_error(key, e))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let r_opts = cacache::index::RemoveOpts::new().remove_fully(true);
        r_opts
            .remove(self.root.as_path(), key)
            .await
            .map_err(|e| map_cacache_error(key, e))
    }
}
