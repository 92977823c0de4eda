//! Write barrier
//!
//! Every reference store goes through [`WriteBarrier::on_reference_write`].
//! Outside marking it only maintains remembered sets. While marking:
//!
//! - SATB (deletion) half: the overwritten referent is shaded gray
//! - Dijkstra (insertion) half: a white referent stored into a black object
//!   is shaded gray
//!
//! Shaded objects go to the barrier buffer, which the marker drains during
//! concurrent trace and once more at final mark.

use crate::address::Address;
use crate::config::BarrierMode;
use crate::region::RegionTable;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Gray objects produced by the barrier
#[derive(Debug, Default)]
pub struct BarrierBuffer {
    entries: Mutex<Vec<Address>>,
}

impl BarrierBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a gray object
    pub fn push(&self, addr: Address) {
        self.entries.lock().push(addr);
    }

    /// Take every entry
    pub fn drain(&self) -> Vec<Address> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Pending entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Barrier counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierStats {
    /// Reference stores seen
    pub writes: u64,
    /// Objects shaded by the barrier
    pub shaded: u64,
    /// Slots added to remembered sets
    pub remembered: u64,
}

/// Generational plus concurrent-marking write barrier
#[derive(Debug)]
pub struct WriteBarrier {
    mode: BarrierMode,
    marking: CachePadded<AtomicBool>,
    buffer: BarrierBuffer,
    writes: AtomicU64,
    shaded: AtomicU64,
    remembered: AtomicU64,
}

impl WriteBarrier {
    /// Barrier of the given flavor, marking inactive
    pub fn new(mode: BarrierMode) -> Self {
        Self {
            mode,
            marking: CachePadded::new(AtomicBool::new(false)),
            buffer: BarrierBuffer::new(),
            writes: AtomicU64::new(0),
            shaded: AtomicU64::new(0),
            remembered: AtomicU64::new(0),
        }
    }

    /// Configured flavor
    pub fn mode(&self) -> BarrierMode {
        self.mode
    }

    /// Whether marking barriers are armed
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    /// Arm or disarm marking barriers. Safepoint only.
    pub(crate) fn set_marking(&self, active: bool) {
        self.marking.store(active, Ordering::Release);
    }

    /// Pending gray objects
    pub fn buffer(&self) -> &BarrierBuffer {
        &self.buffer
    }

    /// Record a store of `new` over `old` into `slot` of `object`
    pub fn on_reference_write(
        &self,
        regions: &RegionTable,
        object: Address,
        slot: Address,
        old: Address,
        new: Address,
    ) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let Some(source) = regions.region_for(object) else {
            return;
        };

        if !new.is_null() && !source.tag().is_young() {
            if let Some(target) = regions.region_for(new) {
                if target.index() != source.index() && target.remset.add(slot) {
                    self.remembered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if !self.is_marking() {
            return;
        }
        if matches!(self.mode, BarrierMode::Satb | BarrierMode::Hybrid) && !old.is_null() {
            self.shade(regions, old);
        }
        if matches!(self.mode, BarrierMode::IncrementalUpdate | BarrierMode::Hybrid)
            && !new.is_null()
            && source.bitmap.is_scanned(source.offset_of(object))
        {
            self.shade(regions, new);
        }
    }

    /// Gray `addr` if it is white
    pub(crate) fn shade(&self, regions: &RegionTable, addr: Address) {
        if let Some(region) = regions.region_for(addr) {
            if region.bitmap.mark(region.offset_of(addr)) {
                self.shaded.fetch_add(1, Ordering::Relaxed);
                self.buffer.push(addr);
            }
        }
    }

    /// Counters
    pub fn stats(&self) -> BarrierStats {
        BarrierStats {
            writes: self.writes.load(Ordering::Relaxed),
            shaded: self.shaded.load(Ordering::Relaxed),
            remembered: self.remembered.load(Ordering::Relaxed),
        }
    }
}
