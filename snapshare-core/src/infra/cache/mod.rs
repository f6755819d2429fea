//! On-disk cache infra.
//!
//! This module provides a typed facade around `cacache` for integrity-checked
//! key-value storage used for cache metadata and persisted flags.

pub mod kv_store;

pub use kv_store::*;
