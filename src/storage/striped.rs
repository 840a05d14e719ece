//! Striped-Lock LRU Backend
//!
//! The keyspace is split across N independent [`ThreadSafeLru`] shards.
//! Each shard has its own lock, its own `capacity / N` byte budget and its own
//! recency order, so keys on different shards never contend.
//!
//! ```text
//!            hash(key) % N
//!                  │
//!     ┌────────────┼────────────┐
//!     ▼            ▼            ▼
//! ┌────────┐  ┌────────┐   ┌────────┐
//! │Shard 0 │  │Shard 1 │...│Shard N │
//! │ Mutex  │  │ Mutex  │   │ Mutex  │
//! │ LRU    │  │ LRU    │   │ LRU    │
//! └────────┘  └────────┘   └────────┘
//! ```
//!
//! Global recency is not maintained: a shard may evict its oldest key while
//! an even older key survives on another shard.

use crate::storage::{Storage, StorageError, ThreadSafeLru};
use bytes::Bytes;
use std::hash::{DefaultHasher, Hash, Hasher};

/// An LRU cache partitioned into independently locked shards.
#[derive(Debug)]
pub struct StripedLru {
    shards: Vec<ThreadSafeLru>,
}

impl StripedLru {
    /// Creates `shards` shards, each holding `capacity / shards` bytes.
    pub fn new(capacity: usize, shards: usize) -> Result<Self, StorageError> {
        if shards == 0 {
            return Err(StorageError::NoShards);
        }
        let shard_capacity = capacity / shards;
        if shard_capacity == 0 {
            return Err(StorageError::CapacityTooSmall { capacity, shards });
        }

        Ok(Self::with_shard_capacity(shard_capacity, shards))
    }

    /// Creates `shards` shards of exactly `shard_capacity` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is zero.
    pub fn with_shard_capacity(shard_capacity: usize, shards: usize) -> Self {
        assert!(shards > 0, "a striped cache needs at least one shard");
        Self {
            shards: (0..shards)
                .map(|_| ThreadSafeLru::new(shard_capacity))
                .collect(),
        }
    }

    /// Returns the number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Determines which shard a key belongs to.
    #[inline]
    pub fn shard_for(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Returns the bytes used by one shard.
    pub fn shard_used(&self, shard: usize) -> usize {
        self.shards[shard].used()
    }

    /// Returns the byte budget of one shard.
    pub fn shard_capacity(&self, shard: usize) -> usize {
        self.shards[shard].capacity()
    }

    /// Returns the total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(ThreadSafeLru::len).sum()
    }

    /// Returns true if every shard is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(ThreadSafeLru::is_empty)
    }

    /// Runs the consistency check on every shard.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (i, shard) in self.shards.iter().enumerate() {
            shard
                .check_invariants()
                .map_err(|e| format!("shard {i}: {e}"))?;
        }
        Ok(())
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &ThreadSafeLru {
        &self.shards[self.shard_for(key)]
    }
}

impl Storage for StripedLru {
    fn put(&self, key: Bytes, value: Bytes) -> bool {
        self.shard(&key).put(key, value)
    }

    fn put_if_absent(&self, key: Bytes, value: Bytes) -> bool {
        self.shard(&key).put_if_absent(key, value)
    }

    fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.shard(&key).set(key, value)
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.shard(key).delete(key)
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.shard(key).get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    /// Finds `n` keys that all land on `shard`.
    fn keys_on_shard(cache: &StripedLru, shard: usize, n: usize) -> Vec<Bytes> {
        (0..)
            .map(|i| Bytes::from(format!("key:{}", i)))
            .filter(|k| cache.shard_for(k) == shard)
            .take(n)
            .collect()
    }

    #[test]
    fn test_routing_is_deterministic() {
        let cache = StripedLru::new(1024, 8).unwrap();
        let other = StripedLru::new(4096, 8).unwrap();
        for i in 0..100 {
            let key = format!("key:{}", i);
            assert_eq!(cache.shard_for(key.as_bytes()), other.shard_for(key.as_bytes()));
            assert!(cache.shard_for(key.as_bytes()) < 8);
        }
    }

    #[test]
    fn test_shard_capacity_is_a_slice() {
        let cache = StripedLru::new(100, 4).unwrap();
        assert_eq!(cache.shard_count(), 4);
        for shard in 0..4 {
            assert_eq!(cache.shard_capacity(shard), 25);
        }
    }

    #[test]
    fn test_oversized_for_shard_is_rejected() {
        // 40 bytes total, but only 10 per shard
        let cache = StripedLru::new(40, 4).unwrap();
        assert!(!cache.put(Bytes::from("key"), Bytes::from("12345678")));
        assert!(cache.put(Bytes::from("key"), Bytes::from("1234567")));
    }

    #[test]
    fn test_eviction_is_local_to_a_shard() {
        let cache = StripedLru::with_shard_capacity(8, 2);
        let shard0 = keys_on_shard(&cache, 0, 3);
        let shard1 = keys_on_shard(&cache, 1, 1);

        // Oldest key overall lives on shard 1
        assert!(cache.put(shard1[0].clone(), Bytes::from("x")));
        for key in &shard0 {
            cache.put(key.clone(), Bytes::from("x"));
        }

        // Shard 0 evicted its own head, shard 1 kept its (older) key
        assert!(cache.get(&shard1[0]).is_some());
        assert!(cache.get(&shard0[2]).is_some());
        assert!(cache.shard_used(0) <= cache.shard_capacity(0));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_concurrent_shards() {
        let cache = Arc::new(StripedLru::new(4096, 4).unwrap());
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|shard| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let keys = keys_on_shard(&cache, shard, 32);
                thread::spawn(move || {
                    barrier.wait();
                    for round in 0..200 {
                        for key in &keys {
                            let value = Bytes::from(format!("{}", round));
                            cache.put(key.clone(), value.clone());
                            assert!(cache.get(key).is_some());
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for shard in 0..4 {
            assert!(cache.shard_used(shard) <= cache.shard_capacity(shard));
        }
        cache.check_invariants().unwrap();
    }
}
