//! Heap context and mutator handles
//!
//! [`Heap`] owns every collector component; there is no process-wide
//! state, so independent heaps can coexist. Mutator threads work through a
//! [`Mutator`], which registers them with the safepoint coordinator and owns
//! their thread-local handles.

use crate::address::{Address, WORD_SIZE, block_size};
use crate::allocator::AllocatorStats;
use crate::barrier::{BarrierStats, WriteBarrier};
use crate::collector::{
    CollectionKind, CollectionReport, CollectorDriver, CollectorState, ConcurrentMarkThread, GcCause,
    GcStats,
};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::free_list::FreeListStats;
use crate::generation::Generations;
use crate::marker::{ConcurrentMarker, MarkPhase, MarkStats, WorkerPolicy};
use crate::object::{MarkColor, ObjectMeta};
use crate::region::{GenerationTag, HeapRegion, RegionTable, RegionTelemetry};
use crate::roots::{Handle, HandleTable, RootProvider, RootSlot};
use crate::safepoint::{MutatorState, SafepointCoordinator, SafepointStats};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, fence};

const SPACES: [GenerationTag; 3] = [GenerationTag::Eden, GenerationTag::Survivor, GenerationTag::Old];

/// State shared by the heap, its mutators and the collector threads
pub(crate) struct HeapCore {
    pub(crate) config: GcConfig,
    pub(crate) regions: Arc<RegionTable>,
    pub(crate) generations: Generations,
    pub(crate) safepoints: SafepointCoordinator,
    pub(crate) barrier: WriteBarrier,
    pub(crate) marker: ConcurrentMarker,
    pub(crate) driver: CollectorDriver,
    globals: Arc<HandleTable>,
    providers: RwLock<Vec<Arc<dyn RootProvider>>>,
    mutator_roots: RwLock<FxHashMap<usize, Arc<HandleTable>>>,
    mutations: CachePadded<AtomicU64>,
    background: Mutex<Option<ConcurrentMarkThread>>,
}

impl HeapCore {
    /// Visit every root slot: globals, mutator handles, embedder providers
    pub(crate) fn for_each_root(&self, mut f: impl FnMut(&RootSlot)) {
        for slot in self.globals.enumerate_roots() {
            f(&slot);
        }
        for table in self.mutator_roots.read().values() {
            for slot in table.enumerate_roots() {
                f(&slot);
            }
        }
        for provider in self.providers.read().iter() {
            for slot in provider.enumerate_roots() {
                f(&slot);
            }
        }
    }

    /// Sum of every mutation counter; `None` if some root provider does
    /// not track mutations
    pub(crate) fn mutation_epoch(&self) -> Option<u64> {
        let mut epoch = self.mutations.load(Ordering::Acquire);
        epoch = epoch.wrapping_add(self.globals.mutations()?);
        for table in self.mutator_roots.read().values() {
            epoch = epoch.wrapping_add(table.mutations()?);
        }
        for provider in self.providers.read().iter() {
            epoch = epoch.wrapping_add(provider.mutations()?);
        }
        Some(epoch)
    }

    fn bump_mutations(&self, by: u64) {
        self.mutations.fetch_add(by, Ordering::Release);
    }

    /// Bytes in blocks across all spaces
    pub(crate) fn heap_used(&self) -> usize {
        SPACES
            .iter()
            .filter_map(|&tag| self.generations.space(tag))
            .map(|space| space.used())
            .sum()
    }

    pub(crate) fn collect(&self, kind: CollectionKind, cause: GcCause) -> GcResult<CollectionReport> {
        self.driver.collect(self, kind, cause)
    }

    /// One attempt, no collection
    fn try_allocate(&self, size: usize, ref_slots: usize, tenured: bool) -> GcResult<Address> {
        let granted = block_size(size).ok_or(GcError::OutOfMemory { requested: size })?;
        if ref_slots.checked_mul(WORD_SIZE).is_none_or(|bytes| bytes > granted) {
            return Err(GcError::InvalidLayout { size, ref_slots });
        }
        let block = if tenured {
            self.generations.allocate_old(size)?
        } else {
            self.generations.allocate_young(size)?
        };
        let region = self
            .regions
            .region_for(block.address)
            .ok_or(GcError::InvalidAddress(block.address))?;
        region.zero(block.address, block.size);
        let offset = region.offset_of(block.address);
        region
            .objects
            .write()
            .insert(offset, ObjectMeta::new(block.size, ref_slots)?);
        if self.barrier.is_marking() {
            // Allocated black: the object is live for the rest of the cycle.
            region.bitmap.blacken(offset);
        }
        self.bump_mutations(1);
        Ok(block.address)
    }

    fn object_at(&self, object: Address) -> GcResult<(&Arc<HeapRegion>, ObjectMeta)> {
        let region = self
            .regions
            .region_for(object)
            .filter(|r| r.tag() != GenerationTag::Free)
            .ok_or(GcError::InvalidAddress(object))?;
        let meta = region
            .objects
            .read()
            .get(region.offset_of(object))
            .ok_or(GcError::InvalidAddress(object))?;
        Ok((region, meta))
    }

    fn ref_slot(&self, object: Address, field: usize) -> GcResult<(&Arc<HeapRegion>, Address)> {
        let (region, meta) = self.object_at(object)?;
        if field >= meta.ref_slots() {
            return Err(GcError::FieldOutOfBounds {
                object,
                field,
                ref_slots: meta.ref_slots(),
            });
        }
        Ok((region, object.offset(field * WORD_SIZE)))
    }

    fn payload_slot(&self, object: Address, index: usize) -> GcResult<(&Arc<HeapRegion>, Address)> {
        let (region, meta) = self.object_at(object)?;
        let words = meta.size() / WORD_SIZE - meta.ref_slots();
        if index >= words {
            return Err(GcError::PayloadOutOfBounds { object, index, words });
        }
        Ok((region, object.offset((meta.ref_slots() + index) * WORD_SIZE)))
    }

    pub(crate) fn should_start_concurrent_cycle(&self) -> bool {
        self.marker.phase() == MarkPhase::Idle
            && self.generations.old_occupancy_percent(&self.regions)
                >= self.config.initiating_occupancy_percent as usize
    }

    fn maybe_start_concurrent_cycle(&self) {
        if !self.should_start_concurrent_cycle() {
            return;
        }
        if let Some(thread) = self.background.lock().as_ref() {
            if thread.request(GcCause::OccupancyThreshold) {
                tracing::debug!(
                    target: "otter::heap",
                    occupancy = self.generations.old_occupancy_percent(&self.regions),
                    "old occupancy crossed the initiating threshold"
                );
            }
        }
    }
}

/// Verify that objects and free chunks tile `[start, top)` exactly
fn verify_region(region: &HeapRegion) -> GcResult<()> {
    let mut extents: Vec<(usize, usize)> = {
        let objects = region.objects.read();
        let chunks = region.chunks.lock();
        objects
            .iter()
            .map(|(offset, meta)| (offset, meta.size()))
            .chain(chunks.iter().map(|c| (region.offset_of(c.address), c.size)))
            .collect()
    };
    extents.sort_unstable();
    let mut cursor = 0;
    for (offset, size) in extents {
        if offset != cursor {
            let kind = if offset > cursor { "gap" } else { "overlap" };
            return Err(GcError::HeapCorruption(format!(
                "{kind} at {} in region {}",
                region.start().offset(cursor.min(offset)),
                region.index()
            )));
        }
        cursor += size;
    }
    if cursor != region.used() {
        return Err(GcError::HeapCorruption(format!(
            "region {} covers {cursor} of {} bytes below top",
            region.index(),
            region.used()
        )));
    }
    Ok(())
}

/// Object header as seen from outside the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Current address
    pub address: Address,
    /// Block size in bytes
    pub size: usize,
    /// Leading reference words
    pub ref_slots: usize,
    /// Minor collections survived
    pub age: u8,
    /// Generation of the containing region
    pub generation: GenerationTag,
    /// Mark color in the current or last cycle
    pub color: MarkColor,
}

/// Occupancy of one space
#[derive(Debug, Clone)]
pub struct SpaceTelemetry {
    /// Space tag
    pub tag: GenerationTag,
    /// Owned regions
    pub regions: usize,
    /// Region budget
    pub budget: usize,
    /// Bytes in owned regions
    pub capacity: usize,
    /// Bytes in blocks
    pub used: usize,
    /// Bytes in free chunks
    pub free_bytes: usize,
    /// Largest free chunk
    pub largest_free_chunk: usize,
    /// Fragmentation index of the free chunks
    pub fragmentation: f64,
    /// Per size class telemetry
    pub free_lists: Vec<FreeListStats>,
    /// Allocation counters
    pub allocator: AllocatorStats,
}

/// Point-in-time view of the heap
#[derive(Debug, Clone)]
pub struct HeapSnapshot {
    /// Collector state
    pub state: CollectorState,
    /// Committed regions, any tag
    pub regions: Vec<RegionTelemetry>,
    /// Eden, survivor and old
    pub spaces: Vec<SpaceTelemetry>,
    /// Bytes in blocks
    pub heap_used: usize,
    /// Collection statistics
    pub gc: GcStats,
    /// Marking statistics
    pub mark: MarkStats,
    /// Safepoint statistics
    pub safepoints: SafepointStats,
    /// Barrier counters
    pub barrier: BarrierStats,
}

impl HeapSnapshot {
    /// Telemetry of the space tagged `tag`
    pub fn space(&self, tag: GenerationTag) -> Option<&SpaceTelemetry> {
        self.spaces.iter().find(|s| s.tag == tag)
    }
}

/// A garbage-collected heap
///
/// Cloning is cheap; every clone refers to the same heap.
#[derive(Clone)]
pub struct Heap {
    core: Arc<HeapCore>,
}

impl Heap {
    /// Create a heap. Starts the background marker thread if
    /// `config.background_marking` is set.
    pub fn new(config: GcConfig) -> GcResult<Self> {
        config.validate()?;
        let regions = Arc::new(RegionTable::new(&config)?);
        let generations = Generations::new(&config, &regions);
        let policy = WorkerPolicy {
            max_workers: config.max_gc_workers,
            dynamic: config.dynamic_gc_workers,
        };
        let core = HeapCore {
            safepoints: SafepointCoordinator::new(config.safepoint_timeout),
            barrier: WriteBarrier::new(config.barrier_mode),
            marker: ConcurrentMarker::new(policy, config.verify_marking),
            driver: CollectorDriver::new(),
            globals: Arc::new(HandleTable::new()),
            providers: RwLock::new(Vec::new()),
            mutator_roots: RwLock::new(FxHashMap::default()),
            mutations: CachePadded::new(AtomicU64::new(0)),
            background: Mutex::new(None),
            regions,
            generations,
            config,
        };
        let heap = Self { core: Arc::new(core) };
        tracing::debug!(
            target: "otter::heap",
            region_size = heap.core.config.region_size,
            max_regions = heap.core.config.max_regions,
            "heap created"
        );
        if heap.core.config.background_marking {
            heap.start_background_marking()?;
        }
        Ok(heap)
    }

    /// Configuration the heap was built with
    pub fn config(&self) -> &GcConfig {
        &self.core.config
    }

    /// Register the calling thread as a mutator
    pub fn attach(&self) -> Mutator {
        let state = self.core.safepoints.register();
        let roots = Arc::new(HandleTable::new());
        self.core
            .mutator_roots
            .write()
            .insert(state.id(), Arc::clone(&roots));
        Mutator {
            heap: self.clone(),
            state,
            roots,
        }
    }

    /// Global root handle for `addr`
    pub fn root(&self, addr: Address) -> Handle {
        self.core.globals.create(addr)
    }

    /// Global handle table
    pub fn globals(&self) -> &HandleTable {
        &self.core.globals
    }

    /// Add an embedder root provider
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.core.providers.write().push(provider);
        self.core.bump_mutations(1);
    }

    /// Run a collection.
    ///
    /// The calling thread must not be a running mutator; use
    /// [`Mutator::collect`] from mutator threads.
    pub fn collect(&self, kind: CollectionKind) -> GcResult<CollectionReport> {
        self.core.collect(kind, GcCause::Explicit)
    }

    /// Read reference field `field` of `object`
    pub fn read_ref(&self, object: Address, field: usize) -> GcResult<Address> {
        let (region, slot) = self.core.ref_slot(object, field)?;
        Ok(Address::from_word(region.load_word(slot)))
    }

    /// Store `value` into reference field `field` of `object`
    pub fn write_ref(&self, object: Address, field: usize, value: Address) -> GcResult<()> {
        self.on_reference_write(object, field, value)
    }

    /// Reference store hook: performs the store and runs the write barrier
    pub fn on_reference_write(&self, object: Address, field: usize, value: Address) -> GcResult<()> {
        let core = &self.core;
        let (region, slot) = core.ref_slot(object, field)?;
        if !value.is_null() {
            core.object_at(value)?;
        }
        let old = Address::from_word(region.swap_word(slot, value.as_word()));
        // Pairs with the fence after the marker sets the scanned bit.
        fence(Ordering::SeqCst);
        core.barrier
            .on_reference_write(&core.regions, object, slot, old, value);
        core.bump_mutations(1);
        Ok(())
    }

    /// Read payload word `index` (counted after the reference slots)
    pub fn read_payload(&self, object: Address, index: usize) -> GcResult<u64> {
        let (region, slot) = self.core.payload_slot(object, index)?;
        Ok(region.load_word(slot))
    }

    /// Write payload word `index`
    pub fn write_payload(&self, object: Address, index: usize, value: u64) -> GcResult<()> {
        let (region, slot) = self.core.payload_slot(object, index)?;
        region.store_word(slot, value);
        Ok(())
    }

    /// Header of the object at `addr`
    pub fn object(&self, addr: Address) -> Option<ObjectInfo> {
        let (region, meta) = self.core.object_at(addr).ok()?;
        Some(ObjectInfo {
            address: addr,
            size: meta.size(),
            ref_slots: meta.ref_slots(),
            age: meta.age,
            generation: region.tag(),
            color: region.bitmap.color(region.offset_of(addr)),
        })
    }

    /// Mark color of the object at `addr`
    pub fn color(&self, addr: Address) -> Option<MarkColor> {
        self.object(addr).map(|info| info.color)
    }

    /// Current collector state
    pub fn state(&self) -> CollectorState {
        self.core.driver.state()
    }

    /// Collection statistics
    pub fn stats(&self) -> GcStats {
        self.core.driver.stats()
    }

    /// Region table
    pub fn regions(&self) -> &RegionTable {
        &self.core.regions
    }

    /// Eden, survivor and old spaces
    pub fn generations(&self) -> &Generations {
        &self.core.generations
    }

    /// Bytes in blocks across all spaces
    pub fn used(&self) -> usize {
        self.core.heap_used()
    }

    /// Telemetry of every region and space
    pub fn snapshot(&self) -> HeapSnapshot {
        let core = &self.core;
        let spaces = SPACES
            .iter()
            .filter_map(|&tag| core.generations.space(tag))
            .map(|space| SpaceTelemetry {
                tag: space.tag(),
                regions: space.region_count(),
                budget: space.budget(),
                capacity: space.capacity(),
                used: space.used(),
                free_bytes: space.total_free_bytes(),
                largest_free_chunk: space.largest_free_chunk(),
                fragmentation: space.fragmentation(),
                free_lists: space.free_list_stats(),
                allocator: space.stats(),
            })
            .collect();
        HeapSnapshot {
            state: core.driver.state(),
            regions: core.regions.regions().map(|r| r.telemetry()).collect(),
            spaces,
            heap_used: core.heap_used(),
            gc: core.driver.stats(),
            mark: core.marker.stats(),
            safepoints: core.safepoints.stats(),
            barrier: core.barrier.stats(),
        }
    }

    /// Check the partition invariant of every region and the free lists of
    /// every space, at a safepoint. The caller must not be a running mutator.
    pub fn verify(&self) -> GcResult<()> {
        let core = &self.core;
        let _token = core.safepoints.request_safepoint()?;
        for region in core.regions.regions() {
            if region.tag() != GenerationTag::Free {
                verify_region(region)?;
            }
        }
        for space in SPACES.iter().filter_map(|&tag| core.generations.space(tag)) {
            if let Some(region) = space.regions().iter().find(|r| r.tag() != space.tag()) {
                return Err(GcError::HeapCorruption(format!(
                    "{} space owns region {} tagged {}",
                    space.tag().name(),
                    region.index(),
                    region.tag().name()
                )));
            }
            space.verify()?;
        }
        Ok(())
    }

    /// Check that no black object refers to a white one
    pub fn verify_marking(&self) -> GcResult<()> {
        self.core.marker.verify(&self.core)
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &HeapCore {
        &self.core
    }

    /// Whether old occupancy calls for a concurrent cycle
    pub fn should_start_concurrent_cycle(&self) -> bool {
        self.core.should_start_concurrent_cycle()
    }

    /// Start the background marker thread if it is not running
    pub fn start_background_marking(&self) -> GcResult<()> {
        let mut background = self.core.background.lock();
        if background.is_some() {
            return Ok(());
        }
        let thread = ConcurrentMarkThread::spawn(Arc::downgrade(&self.core))
            .map_err(|err| GcError::ThreadSpawn(err.to_string()))?;
        *background = Some(thread);
        Ok(())
    }

    /// Queue a concurrent cycle on the background thread. Returns false if
    /// one is already queued.
    pub fn request_concurrent_cycle(&self) -> GcResult<bool> {
        let background = self.core.background.lock();
        let thread = background.as_ref().ok_or(GcError::Detached)?;
        Ok(thread.request(GcCause::Explicit))
    }

    /// Whether a queued background cycle has not finished
    pub fn concurrent_cycle_pending(&self) -> bool {
        self.core
            .background
            .lock()
            .as_ref()
            .is_some_and(|t| t.is_pending())
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("state", &self.state())
            .field("used", &self.used())
            .field("regions", &self.core.regions.committed_regions())
            .finish()
    }
}

/// A registered mutator thread
///
/// Dropping the mutator unregisters it and releases its handles.
pub struct Mutator {
    heap: Heap,
    state: Arc<MutatorState>,
    roots: Arc<HandleTable>,
}

impl Mutator {
    /// Mutator id
    pub fn id(&self) -> usize {
        self.state.id()
    }

    /// The heap this mutator works on
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Park here if a safepoint is requested
    #[inline]
    pub fn safepoint_poll(&self) {
        self.heap.core.safepoints.poll(&self.state);
    }

    /// Thread-local handle rooting `addr`
    pub fn handle(&self, addr: Address) -> Handle {
        self.roots.create(addr)
    }

    /// Allocate an object of `size` bytes whose first `ref_slots` words
    /// are references. Large requests go to the old generation.
    ///
    /// The block is zeroed. Collects and retries before reporting
    /// `OutOfMemory`; unrooted addresses held across this call may be stale.
    pub fn allocate(&self, size: usize, ref_slots: usize) -> GcResult<Address> {
        let tenured = self.heap.core.generations.is_pretenured(size);
        self.allocate_in(size, ref_slots, tenured)
    }

    /// Allocate directly in the old generation
    pub fn allocate_tenured(&self, size: usize, ref_slots: usize) -> GcResult<Address> {
        self.allocate_in(size, ref_slots, true)
    }

    fn allocate_in(&self, size: usize, ref_slots: usize, tenured: bool) -> GcResult<Address> {
        self.safepoint_poll();
        let core = &self.heap.core;
        // Objects never straddle regions; no collection can help.
        if size > core.config.region_size {
            return Err(GcError::OutOfMemory { requested: size });
        }
        let retries: &[CollectionKind] = if tenured {
            &[CollectionKind::Full]
        } else {
            &[CollectionKind::Minor, CollectionKind::Full]
        };

        let mut attempt = core.try_allocate(size, ref_slots, tenured);
        for &kind in retries {
            if !matches!(&attempt, Err(err) if err.is_allocation_failure()) {
                break;
            }
            self.collect_for(kind, GcCause::AllocationFailure)?;
            attempt = core.try_allocate(size, ref_slots, tenured);
        }

        match attempt {
            Ok(addr) => {
                if tenured {
                    core.maybe_start_concurrent_cycle();
                }
                Ok(addr)
            }
            Err(err) if err.is_allocation_failure() => {
                tracing::warn!(target: "otter::heap", requested = size, tenured, "allocation failed after collection");
                if core.regions.available_regions() == 0 {
                    Err(GcError::OutOfAddressSpace {
                        max_regions: core.regions.max_regions(),
                    })
                } else {
                    Err(GcError::OutOfMemory {
                        requested: block_size(size).unwrap_or(size),
                    })
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Run a collection with this mutator in a safe region
    pub fn collect(&self, kind: CollectionKind) -> GcResult<CollectionReport> {
        self.collect_for(kind, GcCause::Explicit)
    }

    fn collect_for(&self, kind: CollectionKind, cause: GcCause) -> GcResult<CollectionReport> {
        let core = &self.heap.core;
        let report = {
            let _safe = core.safepoints.blocked(&self.state);
            core.collect(kind, cause)
        }?;
        if report.kind == CollectionKind::Minor {
            core.maybe_start_concurrent_cycle();
        }
        Ok(report)
    }

    /// Run `f` in a safe region. `f` must not touch the heap.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        let _safe = self.heap.core.safepoints.blocked(&self.state);
        f()
    }

    /// Read reference field `field` of `object`
    pub fn read_ref(&self, object: Address, field: usize) -> GcResult<Address> {
        self.heap.read_ref(object, field)
    }

    /// Store `value` into reference field `field` of `object`
    pub fn write_ref(&self, object: Address, field: usize, value: Address) -> GcResult<()> {
        self.heap.write_ref(object, field, value)
    }

    /// Read payload word `index`
    pub fn read_payload(&self, object: Address, index: usize) -> GcResult<u64> {
        self.heap.read_payload(object, index)
    }

    /// Write payload word `index`
    pub fn write_payload(&self, object: Address, index: usize, value: u64) -> GcResult<()> {
        self.heap.write_payload(object, index, value)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let core = &self.heap.core;
        if let Some(table) = core.mutator_roots.write().remove(&self.state.id()) {
            // Keep the epoch sum from moving backwards.
            core.bump_mutations(table.mutations().unwrap_or(0).wrapping_add(1));
        }
        core.safepoints.unregister(&self.state);
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id())
            .field("status", &self.state.status())
            .finish()
    }
}
