use async_trait::async_trait;

use crate::error::Result;

/// Local persistent key-value storage (cache metadata, permission flags).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}
