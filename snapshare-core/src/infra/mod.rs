//! Adapters for the collaborator ports.

pub mod cache;
pub mod http_blob_store;
pub mod media_library;
pub mod memory;

pub use cache::CacacheKeyValueStore;
pub use http_blob_store::HttpBlobStore;
pub use media_library::DirectoryMediaLibrary;
pub use memory::{InMemoryBlobStore, InMemoryDataService, InMemoryKeyValueStore};
