//! Sliding compaction of the old generation
//!
//! Four passes over the old regions in address order:
//!
//! 1. Plan: assign every live object a destination, packing objects toward
//!    the low end region by region (objects never straddle regions)
//! 2. Update: rewrite roots and every reference slot in the heap through
//!    the forwarding table
//! 3. Move: copy objects lowest first; a destination never lies above its
//!    source, so no live word is overwritten before it is copied
//! 4. Reset: rebuild object maps, tops and remembered sets, release emptied
//!    regions, and reopen the tail of the last destination region for bump
//!    allocation

use crate::address::{Address, MIN_CHUNK_SIZE, WORD_SIZE};
use crate::error::GcResult;
use crate::free_list::FreeChunk;
use crate::generation::remember_young_referents;
use crate::heap::HeapCore;
use crate::object::ObjectMeta;
use crate::region::{GenerationTag, HeapRegion};
use crate::safepoint::SafepointToken;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Result of a compaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactOutcome {
    /// Objects that changed address
    pub moved_objects: usize,
    /// Bytes that changed address
    pub moved_bytes: usize,
    /// Live bytes in the old generation
    pub live_bytes: usize,
    /// Regions returned to the free pool
    pub regions_released: usize,
}

struct Move {
    from: Address,
    to: Address,
    source: usize,
    target: usize,
    meta: ObjectMeta,
}

/// Compact the old generation. Requires a safepoint.
pub(crate) fn compact_old(core: &HeapCore, token: &SafepointToken<'_>) -> GcResult<CompactOutcome> {
    let old = core.generations.old();
    let table = &core.regions;
    old.retire_active();
    let regions: Vec<Arc<HeapRegion>> = old.regions();
    let mut outcome = CompactOutcome::default();
    if regions.is_empty() {
        return Ok(outcome);
    }
    for region in &regions {
        old.remove_region_chunks(region);
    }

    // Plan
    let region_size = table.region_size();
    let mut plan = Vec::new();
    let mut forwarding: FxHashMap<Address, Address> = FxHashMap::default();
    let mut high_water = vec![0usize; regions.len()];
    let (mut dest, mut dest_offset) = (0usize, 0usize);
    for (source, region) in regions.iter().enumerate() {
        for (offset, meta) in region.objects.read().iter() {
            if dest_offset + meta.size() > region_size {
                high_water[dest] = dest_offset;
                dest += 1;
                dest_offset = 0;
            }
            let from = region.start().offset(offset);
            let to = regions[dest].start().offset(dest_offset);
            debug_assert!(to <= from);
            if to != from {
                forwarding.insert(from, to);
                outcome.moved_objects += 1;
                outcome.moved_bytes += meta.size();
            }
            plan.push(Move {
                from,
                to,
                source,
                target: dest,
                meta,
            });
            dest_offset += meta.size();
            outcome.live_bytes += meta.size();
        }
    }
    high_water[dest] = dest_offset;
    let last = dest;

    // Update
    if !forwarding.is_empty() {
        core.for_each_root(|slot| {
            if let Some(&to) = forwarding.get(&slot.load()) {
                slot.store(to);
            }
        });
        for region in table.regions() {
            if region.tag() == GenerationTag::Free {
                continue;
            }
            let objects: Vec<_> = region.objects.read().iter().collect();
            for (offset, meta) in objects {
                let object = region.start().offset(offset);
                for i in 0..meta.ref_slots() {
                    let slot = object.offset(i * WORD_SIZE);
                    let value = Address::from_word(region.load_word(slot));
                    if let Some(&to) = forwarding.get(&value) {
                        region.store_word(slot, to.as_word());
                    }
                }
            }
        }
    }

    // Move
    for m in &plan {
        if m.from != m.to {
            regions[m.source].copy_to(m.from, &regions[m.target], m.to, m.meta.size());
        }
    }

    // Reset
    for region in &regions {
        region.objects.write().clear();
    }
    for region in table.regions() {
        region.remset.clear();
    }
    for m in &plan {
        let target = &regions[m.target];
        target.objects.write().insert(target.offset_of(m.to), m.meta);
    }

    for (i, region) in regions.iter().enumerate() {
        let top = region.start().offset(high_water[i]);
        if i > last {
            old.disown_region(region);
            let guard = region.lock();
            table.reclassify_region(region, GenerationTag::Free, &guard, token)?;
            outcome.regions_released += 1;
            continue;
        }
        region.set_live_bytes(high_water[i]);
        if i == last {
            old.set_active(Arc::clone(region), top);
            continue;
        }
        let tail = region_size - high_water[i];
        if tail >= MIN_CHUNK_SIZE {
            region.set_top(region.end());
            old.insert_chunk(region, FreeChunk { address: top, size: tail });
        } else {
            region.set_top(top);
        }
    }

    for region in table.regions() {
        region.bitmap.clear();
    }
    for region in regions.iter().take(last + 1) {
        remember_young_referents(table, region);
    }
    old.reset_after_collection();

    tracing::debug!(
        target: "otter::heap",
        moved = outcome.moved_objects,
        moved_bytes = outcome.moved_bytes,
        live = outcome.live_bytes,
        released = outcome.regions_released,
        "compacted old generation"
    );
    Ok(outcome)
}
