//! Storage Module
//!
//! This module provides the cache backends for LruKV. Every backend implements
//! the [`Storage`] contract, so connections and commands never care which one
//! is running underneath.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Arc<dyn Storage>                         │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐   ┌───────────────────────────────┐
//! │      ThreadSafeLru       │   │          StripedLru           │
//! │  ┌────────────────────┐  │   │ ┌───────┐ ┌───────┐ ┌───────┐ │
//! │  │ Mutex<SimpleLru>   │  │   │ │Shard 0│ │Shard 1│ │...N   │ │
//! │  └────────────────────┘  │   │ │ Mutex │ │ Mutex │ │shards │ │
//! └──────────────────────────┘   │ └───────┘ └───────┘ └───────┘ │
//!                                └───────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded Capacity**: sizes are accounted as key length + value length
//! - **LRU Eviction**: reads and writes both refresh recency
//! - **Single Lock**: [`ThreadSafeLru`] serializes every operation
//! - **Striped Locks**: [`StripedLru`] gives each shard its own lock, capacity
//!   and recency order
//!
//! ## Example
//!
//! ```
//! use lrukv::storage::{Storage, StripedLru};
//! use bytes::Bytes;
//!
//! let storage = StripedLru::new(1024, 4).unwrap();
//! assert!(storage.put(Bytes::from("name"), Bytes::from("Ariz")));
//! assert_eq!(storage.get(b"name"), Some(Bytes::from("Ariz")));
//! ```

pub mod lru;
pub mod striped;
pub mod thread_safe;

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

// Re-export commonly used types
pub use lru::SimpleLru;
pub use striped::StripedLru;
pub use thread_safe::ThreadSafeLru;

/// The contract every cache backend implements.
///
/// Capacity pressure is never an error: every operation reports its outcome
/// as a boolean (or an `Option` for reads).
pub trait Storage: Send + Sync {
    /// Inserts or updates `key`.
    ///
    /// Returns `false` only when `key.len() + value.len()` exceeds the
    /// capacity of the cache (or shard) the key lives in.
    fn put(&self, key: Bytes, value: Bytes) -> bool;

    /// Inserts `key` only if it is absent.
    ///
    /// Returns `false` if the key is present (the value is left unchanged)
    /// or the entry is oversized.
    fn put_if_absent(&self, key: Bytes, value: Bytes) -> bool;

    /// Updates `key` only if it is already present. Never inserts.
    fn set(&self, key: Bytes, value: Bytes) -> bool;

    /// Removes `key`. Returns `false` if it was absent.
    fn delete(&self, key: &[u8]) -> bool;

    /// Returns the current value of `key` and marks it most recently used.
    fn get(&self, key: &[u8]) -> Option<Bytes>;
}

/// Which backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// One [`SimpleLru`] behind a single lock.
    Lru,
    /// Several independently locked shards.
    Striped,
}

/// Errors raised while constructing a backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A striped cache needs at least one shard
    #[error("shard count must be at least 1")]
    NoShards,

    /// The capacity is too small to give every shard a non-zero slice
    #[error("capacity {capacity} is too small for {shards} shards")]
    CapacityTooSmall { capacity: usize, shards: usize },
}

/// Builds the backend selected at startup.
///
/// `shards` is ignored for [`StorageKind::Lru`].
pub fn build(
    kind: StorageKind,
    capacity: usize,
    shards: usize,
) -> Result<Arc<dyn Storage>, StorageError> {
    match kind {
        StorageKind::Lru => Ok(Arc::new(ThreadSafeLru::new(capacity))),
        StorageKind::Striped => Ok(Arc::new(StripedLru::new(capacity, shards)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_backends() {
        for kind in [StorageKind::Lru, StorageKind::Striped] {
            let storage = build(kind, 1024, 4).unwrap();
            assert!(storage.put(Bytes::from("k"), Bytes::from("v")));
            assert_eq!(storage.get(b"k"), Some(Bytes::from("v")));
        }
    }

    #[test]
    fn test_build_rejects_bad_striping() {
        assert_eq!(
            build(StorageKind::Striped, 1024, 0).err(),
            Some(StorageError::NoShards)
        );
        assert_eq!(
            build(StorageKind::Striped, 3, 4).err(),
            Some(StorageError::CapacityTooSmall {
                capacity: 3,
                shards: 4
            })
        );
    }
}
