//! Bounded LRU Cache
//!
//! This module implements [`SimpleLru`], the single-owner cache every other
//! backend is built from. It has no internal locking: callers that share it
//! between threads wrap it in a lock (see [`ThreadSafeLru`]).
//!
//! ## Layout
//!
//! ```text
//!   index: HashMap<Bytes, NodeIndex>
//!            │        │        │
//!            ▼        ▼        ▼
//!   head ─> [n3] <─> [n0] <─> [n7] <─ tail
//!           (LRU)             (MRU)
//! ```
//!
//! Nodes live in an arena (`Vec<LruNode>`) and link to each other by index.
//! Freed slots are recycled through a free list, so a long-running cache does
//! not churn the allocator.
//!
//! ## Size Accounting
//!
//! An entry costs `key.len() + value.len()` bytes. The cache tracks the free
//! budget incrementally in `space_left`, and evicts from the head until an
//! incoming write fits.
//!
//! [`ThreadSafeLru`]: crate::storage::ThreadSafeLru

use bytes::Bytes;
use std::collections::HashMap;
use tracing::trace;

/// Index into the node arena.
type NodeIndex = usize;

/// A node in the recency chain.
#[derive(Debug, Clone)]
struct LruNode {
    key: Bytes,
    value: Bytes,
    /// Less recently used neighbour
    prev: Option<NodeIndex>,
    /// More recently used neighbour
    next: Option<NodeIndex>,
}

impl LruNode {
    #[inline]
    fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// A bounded, byte-accounted LRU cache.
///
/// # Example
///
/// ```
/// use lrukv::storage::SimpleLru;
/// use bytes::Bytes;
///
/// let mut cache = SimpleLru::new(10);
/// assert!(cache.put(Bytes::from("ab"), Bytes::from("12")));
/// assert!(cache.put(Bytes::from("cd"), Bytes::from("3456")));
/// assert!(cache.put(Bytes::from("ef"), Bytes::from("7")));
///
/// // "ab" was least recently used and had to go
/// assert_eq!(cache.get(b"ab"), None);
/// assert_eq!(cache.get(b"cd"), Some(Bytes::from("3456")));
/// ```
#[derive(Debug, Clone)]
pub struct SimpleLru {
    /// Node arena
    arena: Vec<LruNode>,
    /// Recycled arena slots
    free_list: Vec<NodeIndex>,
    /// Key -> arena slot
    index: HashMap<Bytes, NodeIndex>,
    /// Least recently used node
    head: Option<NodeIndex>,
    /// Most recently used node
    tail: Option<NodeIndex>,
    /// Total byte budget
    capacity: usize,
    /// `capacity - used`
    space_left: usize,
}

impl SimpleLru {
    /// Creates an empty cache holding at most `capacity` bytes of keys and values.
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Vec::new(),
            free_list: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            capacity,
            space_left: capacity,
        }
    }

    /// Returns the configured byte budget.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of bytes currently used by keys and values.
    #[inline]
    pub fn used(&self) -> usize {
        self.capacity - self.space_left
    }

    /// Returns the number of bytes still available before eviction kicks in.
    #[inline]
    pub fn space_left(&self) -> usize {
        self.space_left
    }

    /// Returns the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the cache holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Checks for a key without touching its recency.
    #[inline]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts or updates a key.
    ///
    /// Returns `false` only if the entry alone is larger than the whole cache.
    pub fn put(&mut self, key: Bytes, value: Bytes) -> bool {
        if key.len() + value.len() > self.capacity {
            return false;
        }

        match self.index.get(&key).copied() {
            Some(idx) => self.update(idx, value),
            None => self.insert(key, value),
        }
        true
    }

    /// Inserts a key only if it is not already present.
    pub fn put_if_absent(&mut self, key: Bytes, value: Bytes) -> bool {
        if key.len() + value.len() > self.capacity || self.index.contains_key(&key) {
            return false;
        }

        self.insert(key, value);
        true
    }

    /// Updates a key only if it is already present.
    pub fn set(&mut self, key: Bytes, value: Bytes) -> bool {
        if key.len() + value.len() > self.capacity {
            return false;
        }

        match self.index.get(&key).copied() {
            Some(idx) => {
                self.update(idx, value);
                true
            }
            None => false,
        }
    }

    /// Removes a key.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        match self.index.get(key).copied() {
            Some(idx) => {
                self.remove_node(idx);
                true
            }
            None => false,
        }
    }

    /// Returns the value for a key and marks it most recently used.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        let idx = self.index.get(key).copied()?;
        self.to_tail(idx);
        Some(self.arena[idx].value.clone())
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.free_list.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.space_left = self.capacity;
    }

    /// Iterates entries from least to most recently used.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            cache: self,
            cursor: self.head,
        }
    }

    /// Verifies the chain, the index and the size accounting agree.
    ///
    /// Intended for tests and debugging; walks the whole chain.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = 0usize;
        let mut used = 0usize;
        let mut prev: Option<NodeIndex> = None;
        let mut cursor = self.head;

        if let Some(head) = self.head {
            if self.arena[head].prev.is_some() {
                return Err("head has a prev link".to_string());
            }
        }

        while let Some(idx) = cursor {
            let node = &self.arena[idx];
            if node.prev != prev {
                return Err(format!("broken back link at slot {idx}"));
            }
            if self.index.get(&node.key) != Some(&idx) {
                return Err(format!("slot {idx} is not indexed under its key"));
            }
            seen += 1;
            if seen > self.index.len() {
                return Err("chain is longer than the index (cycle?)".to_string());
            }
            used += node.size();
            prev = Some(idx);
            cursor = node.next;
        }

        if prev != self.tail {
            return Err("tail does not terminate the chain".to_string());
        }
        if seen != self.index.len() {
            return Err(format!(
                "chain has {seen} nodes but index has {}",
                self.index.len()
            ));
        }
        if used > self.capacity {
            return Err(format!("used {used} exceeds capacity {}", self.capacity));
        }
        if self.space_left != self.capacity - used {
            return Err(format!(
                "space_left {} disagrees with used {used}",
                self.space_left
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Internal: write paths
    // ========================================================================

    /// Inserts a key known to be absent. The entry must fit the capacity.
    fn insert(&mut self, key: Bytes, value: Bytes) {
        self.make_room(key.len() + value.len());
        self.push_tail(key, value);
    }

    /// Replaces the value of the node at `idx`, evicting older entries as needed.
    fn update(&mut self, idx: NodeIndex, value: Bytes) {
        let old_len = self.arena[idx].value.len();

        if value.len() > old_len {
            let needed = value.len() - old_len;
            while self.space_left < needed {
                if self.head == Some(idx) {
                    // The node being written is the eviction target: drop it
                    // and start over with a fresh node at the tail.
                    let key = self.arena[idx].key.clone();
                    trace!(size = old_len + key.len(), "Evicting the key being updated");
                    self.remove_node(idx);
                    self.insert(key, value);
                    return;
                }
                if !self.pop_head() {
                    break;
                }
            }
        }

        self.space_left = self.space_left + old_len - value.len();
        self.arena[idx].value = value;
        self.to_tail(idx);
    }

    /// Evicts from the head until `size` bytes are free.
    fn make_room(&mut self, size: usize) {
        while self.space_left < size {
            if !self.pop_head() {
                break;
            }
        }
    }

    /// Evicts the least recently used node. Returns false on an empty cache.
    fn pop_head(&mut self) -> bool {
        match self.head {
            Some(idx) => {
                trace!(size = self.arena[idx].size(), "Evicting LRU head");
                self.remove_node(idx);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Internal: node management
    // ========================================================================

    fn push_tail(&mut self, key: Bytes, value: Bytes) {
        let size = key.len() + value.len();
        let node = LruNode {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };

        let idx = match self.free_list.pop() {
            Some(idx) => {
                self.arena[idx] = node;
                idx
            }
            None => {
                self.arena.push(node);
                self.arena.len() - 1
            }
        };

        self.link_tail(idx);
        self.index.insert(key, idx);
        self.space_left -= size;
    }

    fn remove_node(&mut self, idx: NodeIndex) {
        self.unlink(idx);

        let node = &mut self.arena[idx];
        self.space_left += node.size();
        let key = std::mem::take(&mut node.key);
        node.value = Bytes::new();

        self.index.remove(&key);
        self.free_list.push(idx);
    }

    // ========================================================================
    // Internal: chain surgery
    // ========================================================================

    /// Marks `idx` most recently used.
    fn to_tail(&mut self, idx: NodeIndex) {
        if self.tail == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_tail(idx);
    }

    fn unlink(&mut self, idx: NodeIndex) {
        let prev = self.arena[idx].prev.take();
        let next = self.arena[idx].next.take();

        match prev {
            Some(p) => self.arena[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_tail(&mut self, idx: NodeIndex) {
        self.arena[idx].prev = self.tail;
        self.arena[idx].next = None;

        match self.tail {
            Some(t) => self.arena[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }
}

/// Iterator over cache entries, least recently used first.
#[derive(Debug)]
pub struct Iter<'a> {
    cache: &'a SimpleLru,
    cursor: Option<NodeIndex>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a Bytes, &'a Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = &self.cache.arena[idx];
        self.cursor = node.next;
        Some((&node.key, &node.value))
    }
}
