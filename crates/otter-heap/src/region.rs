//! Heap region table
//!
//! The reserved heap range is carved into equal, power-of-two sized
//! regions. A region is committed (its word array allocated) the first time
//! it is handed out and is recycled through the free pool afterwards.
//! Address-to-region lookup is plain arithmetic.

use crate::address::{Address, HEAP_BASE, WORD_SIZE};
use crate::bitmap::MarkBitmap;
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::free_list::ChunkIndex;
use crate::object::ObjectMap;
use crate::remset::RememberedSet;
use crate::safepoint::SafepointToken;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Which space a region belongs to
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationTag {
    /// In the free pool
    Free = 0,
    /// Young allocation space
    Eden = 1,
    /// Young survivor space
    Survivor = 2,
    /// Tenured space
    Old = 3,
}

impl GenerationTag {
    /// Eden or survivor
    #[inline]
    pub fn is_young(self) -> bool {
        matches!(self, GenerationTag::Eden | GenerationTag::Survivor)
    }

    /// Lowercase name used in logs
    pub fn name(self) -> &'static str {
        match self {
            GenerationTag::Free => "free",
            GenerationTag::Eden => "eden",
            GenerationTag::Survivor => "survivor",
            GenerationTag::Old => "old",
        }
    }
}

impl From<u8> for GenerationTag {
    fn from(v: u8) -> Self {
        match v {
            1 => GenerationTag::Eden,
            2 => GenerationTag::Survivor,
            3 => GenerationTag::Old,
            _ => GenerationTag::Free,
        }
    }
}

/// Exclusive structural lock on one region
pub struct RegionLockGuard<'a> {
    region: usize,
    _guard: MutexGuard<'a, ()>,
}

impl RegionLockGuard<'_> {
    /// Index of the locked region
    pub fn region_index(&self) -> usize {
        self.region
    }
}

/// One fixed-size region of the heap
pub struct HeapRegion {
    index: usize,
    start: Address,
    size: usize,
    tag: AtomicU8,
    top: AtomicUsize,
    retired: AtomicBool,
    live_bytes: AtomicUsize,
    lock: Mutex<()>,
    memory: Box<[AtomicU64]>,
    /// Object headers keyed by region offset
    pub(crate) objects: RwLock<ObjectMap>,
    /// Free chunks of this region in address order
    pub(crate) chunks: Mutex<ChunkIndex>,
    /// Tri-color mark state
    pub(crate) bitmap: MarkBitmap,
    /// Incoming cross-region reference slots
    pub(crate) remset: RememberedSet,
}

impl HeapRegion {
    fn new(index: usize, start: Address, size: usize) -> Self {
        Self {
            index,
            start,
            size,
            tag: AtomicU8::new(GenerationTag::Free as u8),
            top: AtomicUsize::new(start.as_usize()),
            retired: AtomicBool::new(false),
            live_bytes: AtomicUsize::new(0),
            lock: Mutex::new(()),
            memory: (0..size / WORD_SIZE).map(|_| AtomicU64::new(0)).collect(),
            objects: RwLock::new(ObjectMap::new()),
            chunks: Mutex::new(ChunkIndex::new()),
            bitmap: MarkBitmap::new(size),
            remset: RememberedSet::new(),
        }
    }

    /// Position in the region table
    pub fn index(&self) -> usize {
        self.index
    }

    /// First byte
    pub fn start(&self) -> Address {
        self.start
    }

    /// One past the last byte
    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }

    /// Region size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current generation tag
    #[inline]
    pub fn tag(&self) -> GenerationTag {
        GenerationTag::from(self.tag.load(Ordering::Acquire))
    }

    /// Bump pointer
    #[inline]
    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }

    /// Bytes below the bump pointer
    pub fn used(&self) -> usize {
        self.top().diff(self.start)
    }

    /// Bytes above the bump pointer
    pub fn remaining(&self) -> usize {
        self.end().diff(self.top())
    }

    /// Whether bump allocation is frozen
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Whether `addr` falls inside this region
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Region-relative offset of `addr`
    #[inline]
    pub fn offset_of(&self, addr: Address) -> usize {
        addr.diff(self.start)
    }

    /// Live bytes as of the last marking or sweep
    pub fn live_bytes_estimate(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Take the structural lock
    pub fn lock(&self) -> RegionLockGuard<'_> {
        RegionLockGuard {
            region: self.index,
            _guard: self.lock.lock(),
        }
    }

    /// Bump-allocate `size` bytes
    pub(crate) fn bump(&self, size: usize) -> Option<Address> {
        if self.is_retired() {
            return None;
        }
        let end = self.end().as_usize();
        let mut current = self.top.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(size).filter(|&n| n <= end)?;
            match self
                .top
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(Address::new(current)),
                Err(observed) => current = observed,
            }
        }
    }

    /// Move `top` back from `from` to `to` if nothing was bumped past `from`
    pub(crate) fn retract_top(&self, from: Address, to: Address) -> bool {
        if self.is_retired() {
            return false;
        }
        self.top
            .compare_exchange(
                from.as_usize(),
                to.as_usize(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Freeze bump allocation and claim the tail; returns the unused tail
    pub(crate) fn retire(&self) -> Option<(Address, usize)> {
        if self.retired.swap(true, Ordering::AcqRel) {
            return None;
        }
        let end = self.end().as_usize();
        let top = self.top.swap(end, Ordering::AcqRel);
        (top < end).then(|| (Address::new(top), end - top))
    }

    /// Reopen a region for bump allocation at `top`. Safepoint only.
    pub(crate) fn reopen(&self, top: Address) {
        self.top.store(top.as_usize(), Ordering::Release);
        self.retired.store(false, Ordering::Release);
    }

    /// Force `top`. Safepoint only.
    pub(crate) fn set_top(&self, top: Address) {
        self.top.store(top.as_usize(), Ordering::Release);
    }

    fn reset(&self) {
        self.top.store(self.start.as_usize(), Ordering::Release);
        self.retired.store(false, Ordering::Release);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.objects.write().clear();
        self.chunks.lock().drain();
        self.bitmap.clear();
        self.remset.clear();
    }

    #[inline]
    fn word_index(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr) && addr.is_word_aligned());
        addr.diff(self.start) / WORD_SIZE
    }

    /// Load the word at `addr`
    #[inline]
    pub fn load_word(&self, addr: Address) -> u64 {
        self.memory[self.word_index(addr)].load(Ordering::Acquire)
    }

    /// Store the word at `addr`
    #[inline]
    pub fn store_word(&self, addr: Address, value: u64) {
        self.memory[self.word_index(addr)].store(value, Ordering::Release);
    }

    /// Replace the word at `addr`, returning the previous value
    #[inline]
    pub fn swap_word(&self, addr: Address, value: u64) -> u64 {
        self.memory[self.word_index(addr)].swap(value, Ordering::AcqRel)
    }

    /// Zero `bytes` starting at `addr`
    pub(crate) fn zero(&self, addr: Address, bytes: usize) {
        let first = self.word_index(addr);
        for word in &self.memory[first..first + bytes / WORD_SIZE] {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Copy `bytes` from `src` in this region to `dst` in `target`, lowest word first
    pub(crate) fn copy_to(&self, src: Address, target: &HeapRegion, dst: Address, bytes: usize) {
        let from = self.word_index(src);
        let to = target.word_index(dst);
        for i in 0..bytes / WORD_SIZE {
            let value = self.memory[from + i].load(Ordering::Relaxed);
            target.memory[to + i].store(value, Ordering::Relaxed);
        }
    }

    /// Occupancy snapshot
    pub fn telemetry(&self) -> RegionTelemetry {
        let (objects, object_bytes) = {
            let map = self.objects.read();
            (map.len(), map.bytes())
        };
        let (free_chunks, free_bytes) = {
            let chunks = self.chunks.lock();
            (chunks.len(), chunks.bytes())
        };
        RegionTelemetry {
            index: self.index,
            start: self.start,
            tag: self.tag(),
            used: self.used(),
            live_bytes_estimate: self.live_bytes_estimate(),
            objects,
            object_bytes,
            free_chunks,
            free_bytes,
            remembered_slots: self.remset.len(),
        }
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegion")
            .field("index", &self.index)
            .field("start", &self.start)
            .field("tag", &self.tag())
            .field("top", &self.top())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Occupancy of one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTelemetry {
    /// Region index
    pub index: usize,
    /// First byte
    pub start: Address,
    /// Generation tag
    pub tag: GenerationTag,
    /// Bytes below top
    pub used: usize,
    /// Live bytes as of the last marking or sweep
    pub live_bytes_estimate: usize,
    /// Object count
    pub objects: usize,
    /// Bytes in objects
    pub object_bytes: usize,
    /// Free chunk count
    pub free_chunks: usize,
    /// Bytes in free chunks
    pub free_bytes: usize,
    /// Remembered slots pointing into the region
    pub remembered_slots: usize,
}

/// The reserved heap range and its regions
pub struct RegionTable {
    base: Address,
    region_size: usize,
    shift: u32,
    slots: Box<[OnceLock<Arc<HeapRegion>>]>,
    committed: AtomicUsize,
    /// Free region indices, highest first so `pop` yields the lowest address
    free: Mutex<Vec<usize>>,
}

impl RegionTable {
    /// Reserve the range described by `config` and commit its initial regions
    pub fn new(config: &GcConfig) -> GcResult<Self> {
        config.validate()?;
        let table = Self {
            base: Address::new(HEAP_BASE),
            region_size: config.region_size,
            shift: config.region_size.trailing_zeros(),
            slots: (0..config.max_regions).map(|_| OnceLock::new()).collect(),
            committed: AtomicUsize::new(0),
            free: Mutex::new(Vec::with_capacity(config.max_regions)),
        };
        {
            let mut free = table.free.lock();
            for _ in 0..config.initial_regions {
                let index = table.commit_next()?;
                free.push(index);
            }
            free.reverse();
        }
        Ok(table)
    }

    fn commit_next(&self) -> GcResult<usize> {
        let index = self.committed.load(Ordering::Acquire);
        if index >= self.slots.len() {
            return Err(GcError::OutOfAddressSpace {
                max_regions: self.slots.len(),
            });
        }
        let start = self.base.offset(index * self.region_size);
        let region = Arc::new(HeapRegion::new(index, start, self.region_size));
        let _ = self.slots[index].set(region);
        self.committed.store(index + 1, Ordering::Release);
        tracing::trace!(target: "otter::heap", region = index, %start, "committed region");
        Ok(index)
    }

    /// Region size in bytes
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Size of the reserved range in regions
    pub fn max_regions(&self) -> usize {
        self.slots.len()
    }

    /// Regions whose memory has been allocated
    pub fn committed_regions(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Regions that `allocate_region` can still hand out
    pub fn available_regions(&self) -> usize {
        self.free.lock().len() + self.max_regions() - self.committed_regions()
    }

    /// Take a free region and tag it
    pub fn allocate_region(&self, tag: GenerationTag) -> GcResult<Arc<HeapRegion>> {
        let mut free = self.free.lock();
        let index = match free.pop() {
            Some(index) => index,
            None => self.commit_next()?,
        };
        drop(free);
        let region = self.region(index).ok_or(GcError::OutOfAddressSpace {
            max_regions: self.max_regions(),
        })?;
        region.reopen(region.start());
        region.tag.store(tag as u8, Ordering::Release);
        tracing::trace!(target: "otter::heap", region = index, tag = tag.name(), "allocated region");
        Ok(Arc::clone(region))
    }

    /// Freeze bump allocation; returns the unused tail, if any
    pub fn retire_region(&self, region: &HeapRegion) -> Option<(Address, usize)> {
        region.retire()
    }

    /// Reassign the tag of a retired region.
    ///
    /// Moving to [`GenerationTag::Free`] resets the region and returns it to
    /// the free pool.
    pub fn reclassify_region(
        &self,
        region: &HeapRegion,
        tag: GenerationTag,
        guard: &RegionLockGuard<'_>,
        _token: &SafepointToken<'_>,
    ) -> GcResult<()> {
        if guard.region_index() != region.index() {
            return Err(GcError::InvalidAddress(region.start()));
        }
        let previous = region.tag();
        if tag == GenerationTag::Free {
            region.reset();
            region.tag.store(GenerationTag::Free as u8, Ordering::Release);
            let mut free = self.free.lock();
            let pos = free.partition_point(|&i| i > region.index());
            free.insert(pos, region.index());
        } else {
            region.tag.store(tag as u8, Ordering::Release);
        }
        tracing::trace!(
            target: "otter::heap",
            region = region.index(),
            from = previous.name(),
            to = tag.name(),
            "reclassified region"
        );
        Ok(())
    }

    /// Region by index, if committed
    #[inline]
    pub fn region(&self, index: usize) -> Option<&Arc<HeapRegion>> {
        self.slots.get(index)?.get()
    }

    /// Region containing `addr`, if committed
    #[inline]
    pub fn region_for(&self, addr: Address) -> Option<&Arc<HeapRegion>> {
        if addr < self.base {
            return None;
        }
        self.region(addr.diff(self.base) >> self.shift)
    }

    /// Committed regions in address order
    pub fn regions(&self) -> impl Iterator<Item = &Arc<HeapRegion>> + '_ {
        self.slots[..self.committed_regions()]
            .iter()
            .filter_map(|slot| slot.get())
    }

    /// Committed regions currently tagged `tag`
    pub fn regions_tagged(&self, tag: GenerationTag) -> Vec<Arc<HeapRegion>> {
        self.regions()
            .filter(|r| r.tag() == tag)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for RegionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionTable")
            .field("base", &self.base)
            .field("region_size", &self.region_size)
            .field("committed", &self.committed_regions())
            .field("max_regions", &self.max_regions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::SafepointCoordinator;

    fn table(initial: usize, max: usize) -> RegionTable {
        let mut config = GcConfig::small().with_max_regions(max);
        config.initial_regions = initial;
        config.eden_regions = 1;
        config.survivor_regions = 1;
        RegionTable::new(&config).unwrap()
    }

    #[test]
    fn test_allocate_lowest_first_and_commit_on_demand() {
        let table = table(2, 4);
        assert_eq!(table.committed_regions(), 2);
        let a = table.allocate_region(GenerationTag::Eden).unwrap();
        let b = table.allocate_region(GenerationTag::Old).unwrap();
        let c = table.allocate_region(GenerationTag::Old).unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert_eq!(table.committed_regions(), 3);
        assert_eq!(a.tag(), GenerationTag::Eden);
        assert!(a.tag().is_young());
    }

    #[test]
    fn test_out_of_address_space() {
        let table = table(1, 3);
        for _ in 0..3 {
            table.allocate_region(GenerationTag::Old).unwrap();
        }
        assert_eq!(
            table.allocate_region(GenerationTag::Old).unwrap_err(),
            GcError::OutOfAddressSpace { max_regions: 3 }
        );
    }

    #[test]
    fn test_region_lookup() {
        let table = table(2, 4);
        let region = table.allocate_region(GenerationTag::Eden).unwrap();
        let inside = region.start().offset(100 * 8);
        assert_eq!(table.region_for(inside).map(|r| r.index()), Some(region.index()));
        assert!(table.region_for(Address::NULL).is_none());
        assert!(table.region_for(Address::new(HEAP_BASE + 3 * table.region_size())).is_none());
    }

    #[test]
    fn test_bump_retract_and_retire() {
        let table = table(1, 4);
        let region = table.allocate_region(GenerationTag::Eden).unwrap();
        let a = region.bump(64).unwrap();
        let b = region.bump(32).unwrap();
        assert_eq!(b, a.offset(64));
        assert!(region.retract_top(b.offset(32), b));
        assert_eq!(region.top(), b);
        assert!(!region.retract_top(b.offset(32), b));

        let tail = table.retire_region(&region).unwrap();
        assert_eq!(tail, (b, region.size() - 64));
        assert!(region.bump(16).is_none());
        assert_eq!(region.top(), region.end());
    }

    #[test]
    fn test_reclassify_to_free_recycles() {
        let table = table(2, 4);
        let coordinator = SafepointCoordinator::new(None);
        let region = table.allocate_region(GenerationTag::Eden).unwrap();
        region.bump(128).unwrap();
        table.retire_region(&region);
        {
            let token = coordinator.request_safepoint().unwrap();
            let guard = region.lock();
            table
                .reclassify_region(&region, GenerationTag::Free, &guard, &token)
                .unwrap();
        }
        assert_eq!(region.tag(), GenerationTag::Free);
        assert_eq!(region.top(), region.start());
        let again = table.allocate_region(GenerationTag::Old).unwrap();
        assert_eq!(again.index(), region.index());
    }
}
