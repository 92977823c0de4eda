//! Segregated free-list allocator
//!
//! One allocator serves one space (eden, survivor or old). It combines
//! bump allocation in the space's active region with size-class free lists
//! of chunks left behind by `free`, sweep and compaction.
//!
//! ## Locking
//!
//! - Each size class has its own lock
//! - Each region has its own coalescing-index lock
//! - Order: region index, then class list. A class lock is never held while
//!   waiting for a region lock.

use crate::address::{Address, MIN_CHUNK_SIZE, block_size};
use crate::config::AdaptivePolicy;
use crate::error::{GcError, GcResult};
use crate::free_list::{AdaptiveFreeList, ChunkIndex, FreeChunk, FreeListStats, SizeClasses};
use crate::region::{GenerationTag, HeapRegion, RegionTable};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A granted block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// First byte
    pub address: Address,
    /// Granted size, at least the requested size
    pub size: usize,
}

/// Allocation counters of one space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Blocks handed out
    pub allocations: u64,
    /// Bytes handed out since the last collection
    pub allocated_since_gc: usize,
    /// Blocks served by bump allocation
    pub bump_allocations: u64,
    /// Blocks served from free lists
    pub list_allocations: u64,
    /// Requests that failed
    pub failures: u64,
}

/// Allocator for one space
pub struct FreeListAllocator {
    tag: GenerationTag,
    regions: Arc<RegionTable>,
    classes: SizeClasses,
    lists: Box<[CachePadded<Mutex<AdaptiveFreeList>>]>,
    owned: RwLock<Vec<Arc<HeapRegion>>>,
    active: RwLock<Option<Arc<HeapRegion>>>,
    budget: AtomicUsize,
    policy: AdaptivePolicy,
    allocations: AtomicU64,
    bump_allocations: AtomicU64,
    list_allocations: AtomicU64,
    failures: AtomicU64,
    allocated_since_gc: AtomicUsize,
    largest_failed_request: AtomicUsize,
}

impl FreeListAllocator {
    /// Allocator for the space tagged `tag`, limited to `budget` regions
    pub fn new(
        tag: GenerationTag,
        regions: Arc<RegionTable>,
        policy: AdaptivePolicy,
        budget: usize,
    ) -> Self {
        let classes = SizeClasses::new(regions.region_size());
        let lists = classes
            .sizes()
            .iter()
            .map(|&size| CachePadded::new(Mutex::new(AdaptiveFreeList::new(size))))
            .collect();
        Self {
            tag,
            regions,
            classes,
            lists,
            owned: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            budget: AtomicUsize::new(budget),
            policy,
            allocations: AtomicU64::new(0),
            bump_allocations: AtomicU64::new(0),
            list_allocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            allocated_since_gc: AtomicUsize::new(0),
            largest_failed_request: AtomicUsize::new(0),
        }
    }

    /// Tag of the regions this allocator owns
    pub fn tag(&self) -> GenerationTag {
        self.tag
    }

    /// Size-class table
    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Allocate a block of at least `size` bytes
    pub fn allocate(&self, size: usize) -> GcResult<Block> {
        let Some(size) = block_size(size).filter(|&s| s <= self.regions.region_size()) else {
            // Never satisfiable; not a fragmentation signal.
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(GcError::OutOfMemory { requested: size });
        };
        let Some(class) = self.classes.ceil_index(size) else {
            return Err(self.fail(size));
        };
        let starved = self.lists[class]
            .lock()
            .record_request(self.policy.demand_weight, self.policy.starvation_threshold);

        let block = match self.take_from_class(class, size) {
            Some(block) => Some(block),
            None if starved => match self.take_from_larger(class + 1, size) {
                Some(block) => Some(block),
                None => self.bump(size)?,
            },
            None => match self.bump(size)? {
                Some(block) => Some(block),
                None => self.take_from_larger(class + 1, size),
            },
        };

        match block {
            Some(block) => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                self.allocated_since_gc
                    .fetch_add(block.size, Ordering::Relaxed);
                Ok(block)
            }
            None => Err(self.fail(size)),
        }
    }

    fn fail(&self, size: usize) -> GcError {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.largest_failed_request
            .fetch_max(size, Ordering::Relaxed);
        GcError::OutOfMemory { requested: size }
    }

    fn take_from_larger(&self, from: usize, size: usize) -> Option<Block> {
        (from..self.lists.len()).find_map(|class| self.take_from_class(class, size))
    }

    /// Pop a chunk of class `class` and split it down to `size`
    fn take_from_class(&self, class: usize, size: usize) -> Option<Block> {
        loop {
            let head = self.lists[class].lock().head()?;
            let region = self.regions.region_for(head.address)?;
            let mut index = region.chunks.lock();
            let chunk = {
                let mut list = self.lists[class].lock();
                match list.take(head.address) {
                    Some(chunk) => {
                        list.record_allocation();
                        chunk
                    }
                    // Raced with another allocation or a coalesce; retry.
                    None => continue,
                }
            };
            index.remove(chunk.address);
            debug_assert!(chunk.size >= size);

            let remainder = chunk.size - size;
            let granted = if remainder >= MIN_CHUNK_SIZE {
                self.lists[class].lock().record_split_death();
                let rest = FreeChunk {
                    address: chunk.address.offset(size),
                    size: remainder,
                };
                index.insert(rest);
                let mut list = self.lists[self.classes.floor_index(remainder)].lock();
                list.record_split_birth();
                list.push(rest);
                size
            } else {
                chunk.size
            };
            self.list_allocations.fetch_add(1, Ordering::Relaxed);
            return Some(Block {
                address: chunk.address,
                size: granted,
            });
        }
    }

    /// Bump in the active region, then in a fresh region
    fn bump(&self, size: usize) -> GcResult<Option<Block>> {
        if let Some(address) = self.active.read().as_ref().and_then(|r| r.bump(size)) {
            self.bump_allocations.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(Block { address, size }));
        }

        let mut active = self.active.write();
        // Another thread may have replaced the region meanwhile.
        if let Some(address) = active.as_ref().and_then(|r| r.bump(size)) {
            self.bump_allocations.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(Block { address, size }));
        }
        if self.owned.read().len() >= self.budget.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let region = match self.regions.allocate_region(self.tag) {
            Ok(region) => region,
            Err(GcError::OutOfAddressSpace { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let address = region.bump(size).ok_or(GcError::OutOfMemory { requested: size })?;
        tracing::debug!(
            target: "otter::heap",
            space = self.tag.name(),
            region = region.index(),
            "new allocation region"
        );
        self.owned.write().push(Arc::clone(&region));
        if let Some(previous) = active.replace(region) {
            self.retire_tail(&previous);
        }
        self.bump_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Block { address, size }))
    }

    fn retire_tail(&self, region: &HeapRegion) {
        let mut index = region.chunks.lock();
        if let Some((address, size)) = self.regions.retire_region(region) {
            if size >= MIN_CHUNK_SIZE {
                self.insert_locked(&mut index, FreeChunk { address, size });
            } else {
                // Too small to track; keep it below top.
                region.set_top(address);
            }
        }
    }

    /// Return a block to the space, coalescing with its neighbors
    pub fn free(&self, address: Address, size: usize) -> GcResult<()> {
        let size = block_size(size)
            .filter(|&s| s <= self.regions.region_size())
            .ok_or(GcError::InvalidAddress(address))?;
        let region = self
            .regions
            .region_for(address)
            .filter(|r| r.tag() == self.tag && address.offset(size) <= r.top())
            .ok_or(GcError::InvalidAddress(address))?;

        let mut index = region.chunks.lock();
        // Double free, or a range overlapping a free chunk on either side.
        let overlaps = index.get(address).is_some()
            || index.first_within(address, address.offset(size)).is_some()
            || index.predecessor(address).is_some_and(|prev| prev.end() > address);
        if overlaps {
            return Err(GcError::InvalidAddress(address));
        }
        let mut chunk = FreeChunk { address, size };
        let mut merged = false;

        if let Some(prev) = index.predecessor(address) {
            if prev.end() == address {
                self.unlink_locked(&mut index, prev);
                chunk = FreeChunk {
                    address: prev.address,
                    size: prev.size + size,
                };
                merged = true;
            }
        }
        if let Some(next) = index.get(chunk.end()) {
            self.unlink_locked(&mut index, next);
            chunk.size += next.size;
            merged = true;
        }

        // A chunk touching top goes back to the bump area.
        if chunk.end() == region.top() && region.retract_top(chunk.end(), chunk.address) {
            return Ok(());
        }

        let mut list = self.lists[self.classes.floor_index(chunk.size)].lock();
        if merged {
            list.record_coal_birth();
        }
        list.record_return(size);
        index.insert(chunk);
        list.push(chunk);
        Ok(())
    }

    fn unlink_locked(&self, index: &mut ChunkIndex, chunk: FreeChunk) {
        index.remove(chunk.address);
        let mut list = self.lists[self.classes.floor_index(chunk.size)].lock();
        list.take(chunk.address);
        list.record_coal_death();
    }

    fn insert_locked(&self, index: &mut ChunkIndex, chunk: FreeChunk) {
        index.insert(chunk);
        let mut list = self.lists[self.classes.floor_index(chunk.size)].lock();
        list.record_return(chunk.size);
        list.push(chunk);
    }

    /// Add an already maximal chunk (sweep, compaction)
    pub(crate) fn insert_chunk(&self, region: &HeapRegion, chunk: FreeChunk) {
        debug_assert!(chunk.size >= MIN_CHUNK_SIZE);
        let mut index = region.chunks.lock();
        self.insert_locked(&mut index, chunk);
    }

    /// Unlink every chunk of `region`
    pub fn remove_region_chunks(&self, region: &HeapRegion) -> Vec<FreeChunk> {
        let mut index = region.chunks.lock();
        let chunks = index.drain();
        for chunk in &chunks {
            self.lists[self.classes.floor_index(chunk.size)]
                .lock()
                .take(chunk.address);
        }
        chunks
    }

    /// Freeze the active region, turning its tail into a chunk
    pub fn retire_active(&self) {
        if let Some(region) = self.active.write().take() {
            self.retire_tail(&region);
        }
    }

    /// The active bump region
    pub fn active_region(&self) -> Option<Arc<HeapRegion>> {
        self.active.read().clone()
    }

    /// Make `region` (already owned) the bump region at its current top. Safepoint only.
    pub(crate) fn set_active(&self, region: Arc<HeapRegion>, top: Address) {
        region.reopen(top);
        if let Some(previous) = self.active.write().replace(region) {
            self.retire_tail(&previous);
        }
    }

    /// Take ownership of a region that changed spaces
    pub(crate) fn adopt_region(&self, region: Arc<HeapRegion>) {
        let mut owned = self.owned.write();
        if !owned.iter().any(|r| r.index() == region.index()) {
            owned.push(region);
        }
    }

    /// Give up a region (it is being released or reclassified)
    pub(crate) fn disown_region(&self, region: &HeapRegion) {
        self.remove_region_chunks(region);
        self.owned.write().retain(|r| r.index() != region.index());
        let mut active = self.active.write();
        if active.as_ref().is_some_and(|r| r.index() == region.index()) {
            *active = None;
        }
    }

    /// Give up every region at once, returning them
    pub(crate) fn take_regions(&self) -> Vec<Arc<HeapRegion>> {
        self.retire_active();
        let regions = std::mem::take(&mut *self.owned.write());
        for region in &regions {
            self.remove_region_chunks(region);
        }
        regions
    }

    /// Owned regions in address order
    pub fn regions(&self) -> Vec<Arc<HeapRegion>> {
        let mut regions = self.owned.read().clone();
        regions.sort_by_key(|r| r.index());
        regions
    }

    /// Owned region count
    pub fn region_count(&self) -> usize {
        self.owned.read().len()
    }

    /// Region budget
    pub fn budget(&self) -> usize {
        self.budget.load(Ordering::Relaxed)
    }

    /// Change the region budget
    pub fn set_budget(&self, regions: usize) {
        self.budget.store(regions, Ordering::Relaxed);
    }

    /// Bytes in owned regions
    pub fn capacity(&self) -> usize {
        self.region_count() * self.regions.region_size()
    }

    /// Bytes in free chunks
    pub fn total_free_bytes(&self) -> usize {
        self.lists.iter().map(|l| l.lock().bytes()).sum()
    }

    /// Bytes left above top in the active region
    pub fn bump_remaining(&self) -> usize {
        self.active
            .read()
            .as_ref()
            .filter(|r| !r.is_retired())
            .map_or(0, |r| r.remaining())
    }

    /// Bytes that could still be granted without a new region
    pub fn free_capacity(&self) -> usize {
        self.total_free_bytes() + self.bump_remaining()
    }

    /// Bytes taken by blocks
    pub fn used(&self) -> usize {
        self.capacity().saturating_sub(self.free_capacity())
    }

    /// Largest free chunk
    pub fn largest_free_chunk(&self) -> usize {
        self.lists
            .iter()
            .rev()
            .find_map(|l| l.lock().chunks().map(|c| c.size).max())
            .unwrap_or(0)
    }

    /// Largest request that failed since the last reset
    pub fn largest_failed_request(&self) -> usize {
        self.largest_failed_request.load(Ordering::Relaxed)
    }

    /// `1 - sum(size^2) / total^2` over free chunks; 0 means one chunk, close
    /// to 1 means many small ones
    pub fn fragmentation(&self) -> f64 {
        let mut total = 0f64;
        let mut squares = 0f64;
        for list in self.lists.iter() {
            for chunk in list.lock().chunks() {
                let size = chunk.size as f64;
                total += size;
                squares += size * size;
            }
        }
        if total == 0.0 {
            0.0
        } else {
            1.0 - squares / (total * total)
        }
    }

    /// Per-class telemetry, non-empty or requested classes only
    pub fn free_list_stats(&self) -> Vec<FreeListStats> {
        self.lists
            .iter()
            .map(|l| FreeListStats::from(&*l.lock()))
            .filter(|s| s.count > 0 || s.census.allocations > 0 || s.census.requests > 0)
            .collect()
    }

    /// Close the census period of every class
    pub fn end_census(&self) {
        for list in self.lists.iter() {
            list.lock().end_census(self.policy.demand_weight);
        }
    }

    /// Counters
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            allocated_since_gc: self.allocated_since_gc.load(Ordering::Relaxed),
            bump_allocations: self.bump_allocations.load(Ordering::Relaxed),
            list_allocations: self.list_allocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Reset per-collection counters
    pub(crate) fn reset_after_collection(&self) {
        self.allocated_since_gc.store(0, Ordering::Relaxed);
        self.largest_failed_request.store(0, Ordering::Relaxed);
    }

    /// Check that every chunk is linked in its class list, indexed by its
    /// region and disjoint from its neighbors
    pub fn verify(&self) -> GcResult<()> {
        let corrupt = |msg: String| Err(GcError::HeapCorruption(msg));
        let mut indexed = 0usize;
        for region in self.owned.read().iter() {
            let index = region.chunks.lock();
            let mut prev_end = region.start();
            for chunk in index.iter() {
                if chunk.address < prev_end || chunk.end() > region.top() {
                    return corrupt(format!(
                        "chunk {} ({} bytes) overlaps in region {}",
                        chunk.address,
                        chunk.size,
                        region.index()
                    ));
                }
                if chunk.size < MIN_CHUNK_SIZE {
                    return corrupt(format!("undersized chunk at {}", chunk.address));
                }
                let class = self.classes.floor_index(chunk.size);
                if !self.lists[class].lock().contains(chunk.address) {
                    return corrupt(format!(
                        "chunk {} missing from class {}",
                        chunk.address,
                        self.classes.class_size(class)
                    ));
                }
                prev_end = chunk.end();
                indexed += 1;
            }
        }
        let linked: usize = self.lists.iter().map(|l| l.lock().count()).sum();
        if linked != indexed {
            return corrupt(format!(
                "{linked} chunks linked but {indexed} indexed in {} space",
                self.tag.name()
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for FreeListAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListAllocator")
            .field("tag", &self.tag)
            .field("regions", &self.region_count())
            .field("budget", &self.budget())
            .field("free_bytes", &self.total_free_bytes())
            .finish()
    }
}
