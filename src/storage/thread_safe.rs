//! Single-lock LRU backend.
//!
//! Every operation takes one mutex around the whole [`SimpleLru`], so the
//! cache behaves exactly like the single-owner version, one caller at a time.

use crate::storage::{SimpleLru, Storage};
use bytes::Bytes;
use parking_lot::Mutex;

/// A [`SimpleLru`] shared between threads behind one lock.
#[derive(Debug)]
pub struct ThreadSafeLru {
    inner: Mutex<SimpleLru>,
}

impl ThreadSafeLru {
    /// Creates a cache holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SimpleLru::new(capacity)),
        }
    }

    /// Returns the byte budget.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Returns the bytes currently in use.
    pub fn used(&self) -> usize {
        self.inner.lock().used()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Runs the chain/index consistency check under the lock.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.inner.lock().check_invariants()
    }
}

impl Storage for ThreadSafeLru {
    fn put(&self, key: Bytes, value: Bytes) -> bool {
        self.inner.lock().put(key, value)
    }

    fn put_if_absent(&self, key: Bytes, value: Bytes) -> bool {
        self.inner.lock().put_if_absent(key, value)
    }

    fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.inner.lock().set(key, value)
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.inner.lock().delete(key)
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.lock().get(key)
    }
}
