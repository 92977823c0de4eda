//! Generations and the young collection
//!
//! ## Design
//!
//! - Young generation: eden (new objects) plus survivor space, each a
//!   [`FreeListAllocator`] with its own region budget
//! - Old generation: a third allocator, bounded only by the region table
//! - Minor collection is a copying scavenge: roots and the remembered sets
//!   of young regions seed a worklist, reachable young objects are copied to
//!   survivor space (or promoted once older than the tenuring threshold),
//!   and evacuated regions go back to the free pool
//! - If the old generation cannot take a promotion the object is
//!   forwarded to itself and its region becomes an old region

use crate::address::{Address, WORD_SIZE};
use crate::allocator::{Block, FreeListAllocator};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::heap::HeapCore;
use crate::object::ObjectMeta;
use crate::region::{GenerationTag, HeapRegion, RegionTable};
use crate::roots::RootSlot;
use crate::safepoint::SafepointToken;
use crate::sweep;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Eden, survivor and old spaces
#[derive(Debug)]
pub struct Generations {
    eden: FreeListAllocator,
    survivor: FreeListAllocator,
    old: FreeListAllocator,
    tenuring_threshold: u8,
    pretenure_threshold: usize,
    old_max_regions: usize,
}

impl Generations {
    /// Spaces sized by `config`
    pub fn new(config: &GcConfig, regions: &Arc<RegionTable>) -> Self {
        let young = config.eden_regions + config.survivor_regions;
        let old_max_regions = config.max_regions - young;
        Self {
            eden: FreeListAllocator::new(
                GenerationTag::Eden,
                Arc::clone(regions),
                config.adaptive,
                config.eden_regions,
            ),
            survivor: FreeListAllocator::new(
                GenerationTag::Survivor,
                Arc::clone(regions),
                config.adaptive,
                config.survivor_regions,
            ),
            old: FreeListAllocator::new(
                GenerationTag::Old,
                Arc::clone(regions),
                config.adaptive,
                old_max_regions,
            ),
            tenuring_threshold: config.tenuring_threshold,
            pretenure_threshold: config.pretenure_threshold,
            old_max_regions,
        }
    }

    /// Eden allocator
    pub fn eden(&self) -> &FreeListAllocator {
        &self.eden
    }

    /// Survivor allocator
    pub fn survivor(&self) -> &FreeListAllocator {
        &self.survivor
    }

    /// Old allocator
    pub fn old(&self) -> &FreeListAllocator {
        &self.old
    }

    /// Allocator serving regions tagged `tag`
    pub fn space(&self, tag: GenerationTag) -> Option<&FreeListAllocator> {
        match tag {
            GenerationTag::Eden => Some(&self.eden),
            GenerationTag::Survivor => Some(&self.survivor),
            GenerationTag::Old => Some(&self.old),
            GenerationTag::Free => None,
        }
    }

    /// Minor collections survived before promotion
    pub fn tenuring_threshold(&self) -> u8 {
        self.tenuring_threshold
    }

    /// Whether a request of `size` bytes bypasses the young generation
    pub fn is_pretenured(&self, size: usize) -> bool {
        size > self.pretenure_threshold
    }

    /// Allocate in eden. Exhaustion is reported, not collected; the caller
    /// runs a minor collection and retries.
    pub fn allocate_young(&self, size: usize) -> GcResult<Block> {
        self.eden.allocate(size)
    }

    /// Allocate in the old generation
    pub fn allocate_old(&self, size: usize) -> GcResult<Block> {
        self.old.allocate(size)
    }

    /// Bytes in young blocks
    pub fn young_used(&self) -> usize {
        self.eden.used() + self.survivor.used()
    }

    /// Largest old capacity in bytes
    pub fn old_max_capacity(&self, regions: &RegionTable) -> usize {
        self.old_max_regions * regions.region_size()
    }

    /// Old occupancy relative to its largest capacity, in percent
    pub fn old_occupancy_percent(&self, regions: &RegionTable) -> usize {
        let max = self.old_max_capacity(regions).max(1);
        self.old.used() * 100 / max
    }

    /// Whether the old generation can absorb every young byte
    pub fn promotion_guarantee(&self, regions: &RegionTable) -> bool {
        let spare_regions = self
            .old_max_regions
            .saturating_sub(self.old.region_count())
            .min(regions.available_regions());
        let headroom = self.old.free_capacity() + spare_regions * regions.region_size();
        headroom >= self.young_used()
    }

    /// Copy the object referenced from `slot` out of `from` into `to`.
    ///
    /// The copy ages by one. Its address is recorded in `forwarding` and
    /// stored into `slot`; other references to the object are rewritten
    /// through `forwarding` as the scavenger visits them.
    pub(crate) fn promote(
        &self,
        regions: &RegionTable,
        slot: ReferenceSlot<'_>,
        from: GenerationTag,
        to: GenerationTag,
        forwarding: &mut FxHashMap<Address, Address>,
    ) -> GcResult<Address> {
        let object = slot.load();
        let region = regions
            .region_for(object)
            .filter(|r| r.tag() == from)
            .ok_or(GcError::InvalidAddress(object))?;
        let meta = region
            .objects
            .read()
            .get(region.offset_of(object))
            .ok_or(GcError::InvalidAddress(object))?;
        let copy = self.evacuate(regions, region, object, meta.with_age(meta.age.saturating_add(1)), to)?;
        forwarding.insert(object, copy);
        slot.store(copy);
        Ok(copy)
    }

    fn evacuate(
        &self,
        regions: &RegionTable,
        region: &HeapRegion,
        object: Address,
        meta: ObjectMeta,
        to: GenerationTag,
    ) -> GcResult<Address> {
        let space = self.space(to).ok_or(GcError::InvalidAddress(object))?;
        let block = space.allocate(meta.size())?;
        let target = regions
            .region_for(block.address)
            .ok_or(GcError::InvalidAddress(block.address))?;
        region.copy_to(object, target, block.address, meta.size());
        if block.size > meta.size() {
            target.zero(block.address.offset(meta.size()), block.size - meta.size());
        }
        let header = ObjectMeta::new(block.size, meta.ref_slots())?.with_age(meta.age);
        target.objects.write().insert(target.offset_of(block.address), header);
        Ok(block.address)
    }
}

/// A word holding a reference to an object being evacuated
#[derive(Clone, Copy)]
pub(crate) enum ReferenceSlot<'a> {
    /// Root handle or provider slot
    Root(&'a RootSlot),
    /// Reference word at the address inside the region
    Heap(&'a HeapRegion, Address),
}

impl ReferenceSlot<'_> {
    fn load(&self) -> Address {
        match self {
            ReferenceSlot::Root(slot) => slot.load(),
            ReferenceSlot::Heap(region, slot) => Address::from_word(region.load_word(*slot)),
        }
    }

    fn store(&self, addr: Address) {
        match self {
            ReferenceSlot::Root(slot) => slot.store(addr),
            ReferenceSlot::Heap(region, slot) => region.store_word(*slot, addr.as_word()),
        }
    }
}

/// Result of a minor collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinorOutcome {
    /// Bytes copied into survivor space
    pub survived_bytes: usize,
    /// Bytes promoted into the old generation
    pub promoted_bytes: usize,
    /// Young bytes reclaimed
    pub reclaimed_bytes: usize,
    /// Objects copied or promoted
    pub objects_copied: usize,
    /// Objects left in place because old space was full
    pub evacuation_failures: usize,
}

impl MinorOutcome {
    /// Whether any object could not be evacuated
    pub fn evacuation_failed(&self) -> bool {
        self.evacuation_failures > 0
    }
}

struct Scavenger<'a> {
    core: &'a HeapCore,
    collection_set: FxHashSet<usize>,
    forwarded: FxHashMap<Address, Address>,
    worklist: Vec<Address>,
    failed_regions: FxHashSet<usize>,
    outcome: MinorOutcome,
}

impl Scavenger<'_> {
    fn in_collection_set(&self, addr: Address) -> Option<&Arc<HeapRegion>> {
        self.core
            .regions
            .region_for(addr)
            .filter(|r| self.collection_set.contains(&r.index()))
    }

    /// Evacuate the referent of `slot` if it is in the collection set and
    /// point the slot at its new address
    fn forward(&mut self, slot: ReferenceSlot<'_>) -> Address {
        let addr = slot.load();
        if addr.is_null() {
            return addr;
        }
        let Some(region) = self.in_collection_set(addr).cloned() else {
            return addr;
        };
        if let Some(&to) = self.forwarded.get(&addr) {
            if to != addr {
                slot.store(to);
            }
            return to;
        }
        let offset = region.offset_of(addr);
        let Some(meta) = region.objects.read().get(offset) else {
            return addr;
        };

        let core = self.core;
        let (generations, regions) = (&core.generations, &core.regions);
        let from = region.tag();
        let age = meta.age.saturating_add(1);
        let tenured = age > generations.tenuring_threshold();
        let copied = if tenured {
            generations
                .promote(regions, slot, from, GenerationTag::Old, &mut self.forwarded)
                .map(|a| (a, true))
        } else {
            generations
                .promote(regions, slot, from, GenerationTag::Survivor, &mut self.forwarded)
                .map(|a| (a, false))
                .or_else(|_| {
                    // Survivor overflow promotes early.
                    generations
                        .promote(regions, slot, from, GenerationTag::Old, &mut self.forwarded)
                        .map(|a| (a, true))
                })
        };

        match copied {
            Ok((to, promoted)) => {
                if promoted {
                    self.outcome.promoted_bytes += meta.size();
                } else {
                    self.outcome.survived_bytes += meta.size();
                }
                self.outcome.objects_copied += 1;
                self.worklist.push(to);
                to
            }
            Err(_) => {
                if let Some(m) = region.objects.write().get_mut(offset) {
                    m.age = age;
                }
                self.outcome.evacuation_failures += 1;
                self.failed_regions.insert(region.index());
                self.forwarded.insert(addr, addr);
                self.worklist.push(addr);
                addr
            }
        }
    }

    fn process_slot(&mut self, slot_region: &HeapRegion, slot: Address) {
        let target = self.forward(ReferenceSlot::Heap(slot_region, slot));
        if slot_region.tag() == GenerationTag::Old && !target.is_null() {
            if let Some(young) = self.core.regions.region_for(target) {
                if young.tag() == GenerationTag::Survivor
                    && !self.collection_set.contains(&young.index())
                {
                    young.remset.add(slot);
                }
            }
        }
    }

    fn scan(&mut self, object: Address) {
        let Some(region) = self.core.regions.region_for(object).cloned() else {
            return;
        };
        let Some(meta) = region.objects.read().get(region.offset_of(object)) else {
            return;
        };
        for i in 0..meta.ref_slots() {
            self.process_slot(&region, object.offset(i * WORD_SIZE));
        }
    }
}

/// Whether `slot` is a reference slot of a live object in an old region
pub(crate) fn is_old_reference_slot(regions: &RegionTable, slot: Address) -> bool {
    let Some(region) = regions.region_for(slot) else {
        return false;
    };
    if region.tag() != GenerationTag::Old || slot >= region.top() {
        return false;
    }
    let offset = region.offset_of(slot);
    region
        .objects
        .read()
        .containing(offset)
        .is_some_and(|(start, meta)| (offset - start) / WORD_SIZE < meta.ref_slots())
}

/// Evacuate the young generation. Requires a safepoint.
pub(crate) fn scavenge(core: &HeapCore, token: &SafepointToken<'_>) -> GcResult<MinorOutcome> {
    let generations = &core.generations;
    let regions = &core.regions;

    let mut from_space = generations.eden.take_regions();
    from_space.extend(generations.survivor.take_regions());
    let from_bytes: usize = from_space.iter().map(|r| r.objects.read().bytes()).sum();

    let mut scavenger = Scavenger {
        core,
        collection_set: from_space.iter().map(|r| r.index()).collect(),
        forwarded: FxHashMap::default(),
        worklist: Vec::new(),
        failed_regions: FxHashSet::default(),
        outcome: MinorOutcome::default(),
    };

    core.for_each_root(|slot| {
        scavenger.forward(ReferenceSlot::Root(slot));
    });

    for region in &from_space {
        for slot in region.remset.snapshot() {
            if !is_old_reference_slot(regions, slot) {
                continue;
            }
            if let Some(slot_region) = regions.region_for(slot).cloned() {
                scavenger.process_slot(&slot_region, slot);
            }
        }
    }

    while let Some(object) = scavenger.worklist.pop() {
        scavenger.scan(object);
    }

    let Scavenger {
        forwarded,
        failed_regions,
        mut outcome,
        ..
    } = scavenger;

    for region in &from_space {
        let guard = region.lock();
        if failed_regions.contains(&region.index()) {
            let start = region.start();
            region
                .objects
                .write()
                .retain(|off, _| forwarded.get(&start.offset(off)) == Some(&start.offset(off)));
            regions.retire_region(region);
            regions.reclassify_region(region, GenerationTag::Old, &guard, token)?;
            region.remset.clear();
            drop(guard);
            generations.old.adopt_region(Arc::clone(region));
            sweep::sweep_region(region, &generations.old, |_, _| true);
            remember_young_referents(regions, region);
        } else {
            regions.reclassify_region(region, GenerationTag::Free, &guard, token)?;
        }
    }

    for region in generations.survivor.regions() {
        region.remset.retain(|slot| is_old_reference_slot(regions, slot));
    }
    generations.eden.reset_after_collection();
    generations.survivor.reset_after_collection();

    let kept = outcome.survived_bytes + outcome.promoted_bytes;
    let failed_bytes: usize = from_space
        .iter()
        .filter(|r| failed_regions.contains(&r.index()))
        .map(|r| r.objects.read().bytes())
        .sum();
    outcome.reclaimed_bytes = from_bytes.saturating_sub(kept + failed_bytes);

    if outcome.evacuation_failed() {
        tracing::warn!(
            target: "otter::heap",
            objects = outcome.evacuation_failures,
            regions = failed_regions.len(),
            "promotion failed; regions kept in place as old"
        );
    }
    Ok(outcome)
}

/// Add remembered-set entries for slots of `region` that point into young regions
pub(crate) fn remember_young_referents(regions: &RegionTable, region: &HeapRegion) {
    let objects: Vec<_> = region.objects.read().iter().collect();
    for (offset, meta) in objects {
        let object = region.start().offset(offset);
        for i in 0..meta.ref_slots() {
            let slot = object.offset(i * WORD_SIZE);
            let value = Address::from_word(region.load_word(slot));
            if value.is_null() {
                continue;
            }
            if let Some(target) = regions.region_for(value) {
                if target.index() != region.index() && target.tag().is_young() {
                    target.remset.add(slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretenure_threshold() {
        let config = GcConfig::small();
        let table = Arc::new(RegionTable::new(&config).unwrap());
        let generations = Generations::new(&config, &table);
        assert!(!generations.is_pretenured(config.pretenure_threshold));
        assert!(generations.is_pretenured(config.pretenure_threshold + 1));
    }

    #[test]
    fn test_promote_forwards_and_updates_slot() {
        let config = GcConfig::small();
        let table = Arc::new(RegionTable::new(&config).unwrap());
        let generations = Generations::new(&config, &table);

        let block = generations.allocate_young(32).unwrap();
        let region = table.region_for(block.address).unwrap().clone();
        region
            .objects
            .write()
            .insert(region.offset_of(block.address), ObjectMeta::new(32, 1).unwrap());
        region.store_word(block.address.offset(8), 0xfeed);

        let root = RootSlot::new(block.address);
        let mut forwarding = FxHashMap::default();
        let moved = generations
            .promote(
                &table,
                ReferenceSlot::Root(&root),
                GenerationTag::Eden,
                GenerationTag::Old,
                &mut forwarding,
            )
            .unwrap();
        assert_eq!(root.load(), moved);
        assert_eq!(forwarding.get(&block.address), Some(&moved));
        let target = table.region_for(moved).unwrap();
        assert_eq!(target.tag(), GenerationTag::Old);
        assert_eq!(target.load_word(moved.offset(8)), 0xfeed);
        let header = target.objects.read().get(target.offset_of(moved)).unwrap();
        assert_eq!((header.ref_slots(), header.age), (1, 1));

        // A heap word referring to the original is rewritten the same way.
        let holder = generations.allocate_old(16).unwrap();
        let holder_region = table.region_for(holder.address).unwrap().clone();
        holder_region.store_word(holder.address, moved.as_word());
        let wrong_space = generations.promote(
            &table,
            ReferenceSlot::Heap(&holder_region, holder.address),
            GenerationTag::Eden,
            GenerationTag::Survivor,
            &mut forwarding,
        );
        assert_eq!(wrong_space, Err(GcError::InvalidAddress(moved)));
        assert_eq!(holder_region.load_word(holder.address), moved.as_word());
    }

    #[test]
    fn test_promotion_guarantee_counts_spare_regions() {
        let config = GcConfig::small();
        let table = Arc::new(RegionTable::new(&config).unwrap());
        let generations = Generations::new(&config, &table);
        generations.allocate_young(4096).unwrap();
        assert!(generations.promotion_guarantee(&table));
    }
}
