//! Sweep
//!
//! Walks the object map of each old region in address order. Runs of dead
//! objects and existing free chunks between live objects are merged into
//! maximal chunks and handed to the old allocator.

use crate::address::{Address, MIN_CHUNK_SIZE};
use crate::allocator::FreeListAllocator;
use crate::free_list::FreeChunk;
use crate::heap::HeapCore;
use crate::object::ObjectMeta;
use crate::region::HeapRegion;
use crate::safepoint::SafepointToken;

/// Result of sweeping one region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSweep {
    /// Bytes in surviving objects
    pub live_bytes: usize,
    /// Bytes in objects that were dropped
    pub reclaimed_bytes: usize,
    /// Chunks produced
    pub chunks: usize,
}

/// Result of a sweep phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Regions swept
    pub regions: usize,
    /// Bytes in surviving objects
    pub live_bytes: usize,
    /// Bytes reclaimed
    pub reclaimed_bytes: usize,
    /// Chunks produced
    pub chunks: usize,
}

/// Rebuild the free chunks of `region`, dropping objects `is_live` rejects.
/// The region must be retired (top frozen).
pub(crate) fn sweep_region(
    region: &HeapRegion,
    space: &FreeListAllocator,
    mut is_live: impl FnMut(usize, &ObjectMeta) -> bool,
) -> RegionSweep {
    space.remove_region_chunks(region);

    let mut result = RegionSweep::default();
    let mut objects = region.objects.write();
    let mut cursor = region.start();
    let mut dead = Vec::new();

    let emit = |from: Address, to: Address, result: &mut RegionSweep| {
        let size = to.diff(from);
        if size >= MIN_CHUNK_SIZE {
            space.insert_chunk(region, FreeChunk { address: from, size });
            result.chunks += 1;
        } else {
            debug_assert_eq!(size, 0, "sub-minimum gap at {from}");
        }
    };

    for (offset, meta) in objects.iter() {
        let address = region.start().offset(offset);
        if is_live(offset, &meta) {
            if address > cursor {
                emit(cursor, address, &mut result);
            }
            cursor = address.offset(meta.size());
            result.live_bytes += meta.size();
        } else {
            dead.push(offset);
            result.reclaimed_bytes += meta.size();
        }
    }
    for offset in dead {
        objects.remove(offset);
    }
    let top = region.top();
    if top > cursor {
        emit(cursor, top, &mut result);
    }
    region.set_live_bytes(result.live_bytes);
    result
}

/// Sweep every old region against the mark bitmap. Requires a safepoint.
pub(crate) fn sweep_old(core: &HeapCore, _token: &SafepointToken<'_>) -> SweepOutcome {
    let old = core.generations.old();
    old.retire_active();

    let mut outcome = SweepOutcome::default();
    for region in old.regions() {
        let swept = sweep_region(&region, old, |offset, _| region.bitmap.is_marked(offset));
        tracing::trace!(
            target: "otter::heap",
            region = region.index(),
            live = swept.live_bytes,
            reclaimed = swept.reclaimed_bytes,
            chunks = swept.chunks,
            "swept region"
        );
        outcome.regions += 1;
        outcome.live_bytes += swept.live_bytes;
        outcome.reclaimed_bytes += swept.reclaimed_bytes;
        outcome.chunks += swept.chunks;
    }
    old.end_census();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdaptivePolicy, GcConfig};
    use crate::region::{GenerationTag, RegionTable};
    use std::sync::Arc;

    #[test]
    fn test_sweep_merges_dead_runs_and_chunks() {
        let table = Arc::new(RegionTable::new(&GcConfig::small()).unwrap());
        let old = FreeListAllocator::new(GenerationTag::Old, Arc::clone(&table), AdaptivePolicy::default(), 4);

        // Six 64-byte objects; the fourth was freed earlier.
        let blocks: Vec<_> = (0..6).map(|_| old.allocate(64).unwrap()).collect();
        let region = table.region_for(blocks[0].address).unwrap().clone();
        for (i, block) in blocks.iter().enumerate() {
            if i != 3 {
                region
                    .objects
                    .write()
                    .insert(region.offset_of(block.address), ObjectMeta::new(64, 0).unwrap());
            }
        }
        old.free(blocks[3].address, 64).unwrap();
        old.retire_active();

        // Objects 0 and 5 live, 1, 2 and 4 dead.
        let swept = sweep_region(&region, &old, |offset, _| offset == 0 || offset == 320);
        assert_eq!(swept.live_bytes, 128);
        assert_eq!(swept.reclaimed_bytes, 192);

        let chunks: Vec<_> = region.chunks.lock().iter().collect();
        assert_eq!(
            chunks,
            vec![
                FreeChunk { address: blocks[1].address, size: 256 },
                FreeChunk { address: blocks[5].address.offset(64), size: region.size() - 384 },
            ]
        );
        assert_eq!(region.objects.read().len(), 2);
        assert!(old.verify().is_ok());
    }
}
