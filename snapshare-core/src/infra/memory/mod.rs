//! In-process adapters, used by tests and offline demos.

mod blob_store;
mod data_service;
mod kv_store;

pub use blob_store::InMemoryBlobStore;
pub use data_service::InMemoryDataService;
pub use kv_store::InMemoryKeyValueStore;
