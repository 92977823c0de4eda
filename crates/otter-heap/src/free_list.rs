//! Segregated free-list building blocks
//!
//! ## Design
//!
//! - [`FreeList`] is a doubly linked list keyed by chunk address, so any
//!   chunk can be unlinked in O(1) when a neighbor coalesces with it
//! - [`AdaptiveFreeList`] wraps one list per size class together with its
//!   census (births, deaths, demand) that drives the adaptive policy
//! - [`ChunkIndex`] orders the free chunks of one region by address for
//!   predecessor/successor lookups during coalescing
//! - [`SizeClasses`] maps block sizes to class indices: exact word steps for
//!   small blocks, four geometric steps per doubling above that

use crate::address::{Address, MIN_CHUNK_SIZE, WORD_SIZE};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::ops::Bound;

/// Largest size served by exact (one word apart) classes
pub const EXACT_CLASS_LIMIT: usize = 256;

/// Steps per doubling above [`EXACT_CLASS_LIMIT`]
const GEOMETRIC_STEPS: usize = 4;

/// A free run of heap words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk {
    /// First byte of the chunk
    pub address: Address,
    /// Length in bytes
    pub size: usize,
}

impl FreeChunk {
    /// One past the last byte
    #[inline]
    pub fn end(&self) -> Address {
        self.address.offset(self.size)
    }
}

#[derive(Debug)]
struct Node<K, V> {
    value: V,
    prev: Option<K>,
    next: Option<K>,
}

/// Doubly linked list over hash-addressed nodes
#[derive(Debug)]
pub struct FreeList<K, V> {
    head: Option<K>,
    tail: Option<K>,
    nodes: FxHashMap<K, Node<K, V>>,
}

impl<K: Copy + Eq + Hash, V> Default for FreeList<K, V> {
    fn default() -> Self {
        Self {
            head: None,
            tail: None,
            nodes: FxHashMap::default(),
        }
    }
}

impl<K: Copy + Eq + Hash, V> FreeList<K, V> {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `key` at the head. An existing entry with the same key is replaced.
    pub fn push_front(&mut self, key: K, value: V) {
        self.remove(&key);
        let old_head = self.head;
        self.nodes.insert(
            key,
            Node {
                value,
                prev: None,
                next: old_head,
            },
        );
        match old_head {
            Some(h) => {
                if let Some(node) = self.nodes.get_mut(&h) {
                    node.prev = Some(key);
                }
            }
            None => self.tail = Some(key),
        }
        self.head = Some(key);
    }

    /// Link `key` at the tail
    pub fn push_back(&mut self, key: K, value: V) {
        self.remove(&key);
        let old_tail = self.tail;
        self.nodes.insert(
            key,
            Node {
                value,
                prev: old_tail,
                next: None,
            },
        );
        match old_tail {
            Some(t) => {
                if let Some(node) = self.nodes.get_mut(&t) {
                    node.next = Some(key);
                }
            }
            None => self.head = Some(key),
        }
        self.tail = Some(key);
    }

    /// Unlink an arbitrary entry
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let node = self.nodes.remove(key)?;
        match node.prev {
            Some(p) => {
                if let Some(prev) = self.nodes.get_mut(&p) {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => {
                if let Some(next) = self.nodes.get_mut(&n) {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        Some(node.value)
    }

    /// Unlink the head
    pub fn pop_front(&mut self) -> Option<(K, V)> {
        let key = self.head?;
        self.remove(&key).map(|v| (key, v))
    }

    /// Head entry without unlinking it
    pub fn front(&self) -> Option<(K, &V)> {
        let key = self.head?;
        self.nodes.get(&key).map(|n| (key, &n.value))
    }

    /// Whether `key` is linked
    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Entries from head to tail
    pub fn iter(&self) -> FreeListIter<'_, K, V> {
        FreeListIter {
            list: self,
            cursor: self.head,
        }
    }

    /// Unlink everything
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }
}

/// Head-to-tail iterator over a [`FreeList`]
pub struct FreeListIter<'a, K, V> {
    list: &'a FreeList<K, V>,
    cursor: Option<K>,
}

impl<'a, K: Copy + Eq + Hash, V> Iterator for FreeListIter<'a, K, V> {
    type Item = (K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let node = self.list.nodes.get(&key)?;
        self.cursor = node.next;
        Some((key, &node.value))
    }
}

/// Per-class census, in the manner of a CMS free-list space
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Census {
    /// Chunks created by splitting a larger chunk
    pub split_births: u64,
    /// Chunks consumed by a split
    pub split_deaths: u64,
    /// Chunks created by coalescing
    pub coal_births: u64,
    /// Chunks consumed by coalescing
    pub coal_deaths: u64,
    /// Requests served from this class
    pub allocations: u64,
    /// Bytes returned to this class by `free` or sweep
    pub returned_bytes: u64,
    /// Requests since the last census
    pub requests: u64,
    /// Moving average of requests per census period
    pub demand: f64,
    /// Moving average of `count` sampled at request time
    pub count_average: f64,
    /// Chunks the class should hold to meet demand
    pub desired: usize,
    /// `count - desired` at the last census
    pub surplus: isize,
    /// `count` at the last census
    pub prev_sweep: usize,
}

/// Free list of one size class
#[derive(Debug)]
pub struct AdaptiveFreeList {
    size: usize,
    chunks: FreeList<Address, usize>,
    bytes: usize,
    census: Census,
}

impl AdaptiveFreeList {
    /// Empty list for class size `size`
    pub fn new(size: usize) -> Self {
        Self {
            size,
            chunks: FreeList::new(),
            bytes: 0,
            census: Census::default(),
        }
    }

    /// Class size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Chunks currently linked
    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes in linked chunks
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Census counters
    pub fn census(&self) -> &Census {
        &self.census
    }

    /// Link a chunk, replacing any chunk linked at the same address
    pub fn push(&mut self, chunk: FreeChunk) {
        if let Some(old) = self.chunks.remove(&chunk.address) {
            self.bytes -= old;
        }
        self.bytes += chunk.size;
        self.chunks.push_front(chunk.address, chunk.size);
    }

    /// Unlink the chunk at `address`
    pub fn take(&mut self, address: Address) -> Option<FreeChunk> {
        let size = self.chunks.remove(&address)?;
        self.bytes -= size;
        Some(FreeChunk { address, size })
    }

    /// Unlink the head chunk
    pub fn pop(&mut self) -> Option<FreeChunk> {
        let (address, size) = self.chunks.pop_front()?;
        self.bytes -= size;
        Some(FreeChunk { address, size })
    }

    /// Head chunk
    pub fn head(&self) -> Option<FreeChunk> {
        self.chunks
            .front()
            .map(|(address, &size)| FreeChunk { address, size })
    }

    /// Whether a chunk at `address` is linked
    pub fn contains(&self, address: Address) -> bool {
        self.chunks.contains(&address)
    }

    /// Linked chunks, head first
    pub fn chunks(&self) -> impl Iterator<Item = FreeChunk> + '_ {
        self.chunks
            .iter()
            .map(|(address, &size)| FreeChunk { address, size })
    }

    /// Sample a request against this class; returns whether the class is starved
    pub fn record_request(&mut self, weight: f64, starvation_threshold: f64) -> bool {
        self.census.requests += 1;
        self.census.count_average =
            weight * self.count() as f64 + (1.0 - weight) * self.census.count_average;
        self.census.count_average < starvation_threshold
    }

    /// Count a served request
    pub fn record_allocation(&mut self) {
        self.census.allocations += 1;
    }

    /// Count a chunk consumed by a split
    pub fn record_split_death(&mut self) {
        self.census.split_deaths += 1;
    }

    /// Count a chunk produced by a split
    pub fn record_split_birth(&mut self) {
        self.census.split_births += 1;
    }

    /// Count a chunk consumed by coalescing
    pub fn record_coal_death(&mut self) {
        self.census.coal_deaths += 1;
    }

    /// Count a chunk produced by coalescing
    pub fn record_coal_birth(&mut self) {
        self.census.coal_births += 1;
    }

    /// Count returned bytes
    pub fn record_return(&mut self, bytes: usize) {
        self.census.returned_bytes += bytes as u64;
    }

    /// Close a census period: fold requests into demand, compute desired/surplus
    pub fn end_census(&mut self, weight: f64) {
        let c = &mut self.census;
        c.demand = weight * c.requests as f64 + (1.0 - weight) * c.demand;
        c.desired = c.demand.ceil() as usize;
        c.surplus = self.chunks.len() as isize - c.desired as isize;
        c.prev_sweep = self.chunks.len();
        c.requests = 0;
    }

    /// Unlink every chunk
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

/// Telemetry snapshot of one size class
#[derive(Debug, Clone, PartialEq)]
pub struct FreeListStats {
    /// Class size
    pub size: usize,
    /// Linked chunks
    pub count: usize,
    /// Linked bytes
    pub bytes: usize,
    /// Census counters
    pub census: Census,
}

impl From<&AdaptiveFreeList> for FreeListStats {
    fn from(list: &AdaptiveFreeList) -> Self {
        Self {
            size: list.size(),
            count: list.count(),
            bytes: list.bytes(),
            census: *list.census(),
        }
    }
}

/// Address-ordered free chunks of one region
#[derive(Debug, Default)]
pub struct ChunkIndex {
    chunks: BTreeMap<Address, usize>,
    bytes: usize,
}

impl ChunkIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk
    pub fn insert(&mut self, chunk: FreeChunk) {
        if let Some(old) = self.chunks.insert(chunk.address, chunk.size) {
            self.bytes -= old;
        }
        self.bytes += chunk.size;
    }

    /// Forget the chunk at `address`
    pub fn remove(&mut self, address: Address) -> Option<FreeChunk> {
        let size = self.chunks.remove(&address)?;
        self.bytes -= size;
        Some(FreeChunk { address, size })
    }

    /// Chunk starting exactly at `address`
    pub fn get(&self, address: Address) -> Option<FreeChunk> {
        self.chunks
            .get(&address)
            .map(|&size| FreeChunk { address, size })
    }

    /// Closest chunk starting below `address`
    pub fn predecessor(&self, address: Address) -> Option<FreeChunk> {
        self.chunks
            .range((Bound::Unbounded, Bound::Excluded(address)))
            .next_back()
            .map(|(&address, &size)| FreeChunk { address, size })
    }

    /// First chunk starting in `(from, to)`
    pub fn first_within(&self, from: Address, to: Address) -> Option<FreeChunk> {
        if to <= from {
            return None;
        }
        self.chunks
            .range((Bound::Excluded(from), Bound::Excluded(to)))
            .next()
            .map(|(&address, &size)| FreeChunk { address, size })
    }

    /// Chunks in address order
    pub fn iter(&self) -> impl Iterator<Item = FreeChunk> + '_ {
        self.chunks
            .iter()
            .map(|(&address, &size)| FreeChunk { address, size })
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Free bytes in the region
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Largest chunk in the region
    pub fn largest(&self) -> usize {
        self.chunks.values().copied().max().unwrap_or(0)
    }

    /// Take every chunk, leaving the index empty
    pub fn drain(&mut self) -> Vec<FreeChunk> {
        let chunks = self.iter().collect();
        self.chunks.clear();
        self.bytes = 0;
        chunks
    }
}

/// Size-class table
#[derive(Debug, Clone)]
pub struct SizeClasses {
    sizes: Vec<usize>,
}

impl SizeClasses {
    /// Classes covering blocks up to `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        let mut sizes: Vec<usize> = (MIN_CHUNK_SIZE..=EXACT_CLASS_LIMIT.min(max_size))
            .step_by(WORD_SIZE)
            .collect();
        let mut base = EXACT_CLASS_LIMIT;
        while sizes.last().is_some_and(|&last| last < max_size) {
            let step = base / GEOMETRIC_STEPS;
            for i in 1..=GEOMETRIC_STEPS {
                sizes.push(base + i * step);
            }
            base *= 2;
        }
        Self { sizes }
    }

    /// Number of classes
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Size of class `index`
    pub fn class_size(&self, index: usize) -> usize {
        self.sizes[index]
    }

    /// Smallest class whose size is at least `size`; every chunk in it fits
    pub fn ceil_index(&self, size: usize) -> Option<usize> {
        let index = self.sizes.partition_point(|&s| s < size);
        (index < self.sizes.len()).then_some(index)
    }

    /// Largest class whose size is at most `size`; a chunk lives here
    pub fn floor_index(&self, size: usize) -> usize {
        self.sizes.partition_point(|&s| s <= size).saturating_sub(1)
    }

    /// All class sizes
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linked_list_unlink_middle() {
        let mut list: FreeList<u32, ()> = FreeList::new();
        list.push_back(1, ());
        list.push_back(2, ());
        list.push_back(3, ());
        assert!(list.remove(&2).is_some());
        let keys: Vec<_> = list.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 3]);
        assert_eq!(list.pop_front().map(|(k, _)| k), Some(1));
        assert_eq!(list.pop_front().map(|(k, _)| k), Some(3));
        assert!(list.is_empty());
        assert!(list.front().is_none());
    }

    #[test]
    fn test_size_classes_exact_then_geometric() {
        let classes = SizeClasses::new(16 * 1024);
        assert_eq!(classes.class_size(0), 16);
        assert_eq!(classes.ceil_index(17).map(|i| classes.class_size(i)), Some(24));
        assert_eq!(classes.ceil_index(256).map(|i| classes.class_size(i)), Some(256));
        assert_eq!(classes.ceil_index(257).map(|i| classes.class_size(i)), Some(320));
        assert_eq!(classes.class_size(classes.floor_index(300)), 256);
        assert_eq!(classes.class_size(classes.floor_index(16 * 1024)), 16 * 1024);
        assert!(classes.ceil_index(16 * 1024 + 8).is_none());
        assert!(classes.sizes().windows(2).all(|w| w[0] < w[1]));
        assert!(classes.sizes().iter().all(|s| s % WORD_SIZE == 0));
    }

    #[test]
    fn test_chunk_index_neighbors() {
        let mut index = ChunkIndex::new();
        let base = Address::new(0x1000);
        index.insert(FreeChunk { address: base, size: 32 });
        index.insert(FreeChunk { address: base.offset(64), size: 16 });
        assert_eq!(index.predecessor(base.offset(64)).map(|c| c.address), Some(base));
        assert!(index.predecessor(base).is_none());
        assert_eq!(index.first_within(base, base.offset(80)).map(|c| c.address), Some(base.offset(64)));
        assert!(index.first_within(base, base.offset(64)).is_none());
        assert_eq!(index.bytes(), 48);
        assert_eq!(index.largest(), 32);
        assert_eq!(index.drain().len(), 2);
        assert!(index.is_empty());
    }

    #[test]
    fn test_relinking_same_address_keeps_byte_count() {
        let mut list = AdaptiveFreeList::new(64);
        let chunk = FreeChunk {
            address: Address::new(0x1000),
            size: 64,
        };
        list.push(chunk);
        list.push(chunk);
        assert_eq!(list.count(), 1);
        assert_eq!(list.bytes(), 64);
        assert_eq!(list.take(chunk.address), Some(chunk));
        assert_eq!(list.bytes(), 0);
    }

    #[test]
    fn test_census_starvation_and_surplus() {
        let mut list = AdaptiveFreeList::new(64);
        assert!(list.record_request(0.5, 0.5));
        for i in 0..4 {
            list.push(FreeChunk {
                address: Address::new(0x1000 + i * 64),
                size: 64,
            });
        }
        assert!(!list.record_request(0.5, 0.5));
        list.end_census(1.0);
        assert_eq!(list.census().desired, 2);
        assert_eq!(list.census().surplus, 2);
        assert_eq!(list.census().requests, 0);
    }
}
