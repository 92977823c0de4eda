//! Root set
//!
//! Roots are slots outside the heap that hold references: thread-local
//! handles, globals, or slots owned by an embedder. The collector reads and
//! rewrites them through [`RootSlot`]; an embedder plugs in by implementing
//! [`RootProvider`].

use crate::address::Address;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A single root reference
#[derive(Debug, Default)]
pub struct RootSlot(AtomicUsize);

impl RootSlot {
    /// Slot holding `addr`
    pub fn new(addr: Address) -> Self {
        Self(AtomicUsize::new(addr.as_usize()))
    }

    /// Current referent
    #[inline]
    pub fn load(&self) -> Address {
        Address::new(self.0.load(Ordering::Acquire))
    }

    /// Replace the referent
    #[inline]
    pub fn store(&self, addr: Address) {
        self.0.store(addr.as_usize(), Ordering::Release);
    }
}

/// Lazy, finite sequence of root slots, consumed once per phase
pub type RootIter<'a> = Box<dyn Iterator<Item = Arc<RootSlot>> + 'a>;

/// Source of root slots
pub trait RootProvider: Send + Sync {
    /// Enumerate every root slot currently held
    fn enumerate_roots(&self) -> RootIter<'_>;

    /// Monotonic count of root mutations, if the provider tracks them.
    ///
    /// Providers returning `None` force every collection request to run.
    fn mutations(&self) -> Option<u64> {
        None
    }
}

/// Table of handles (thread-local roots and globals)
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: RwLock<Vec<Weak<RootSlot>>>,
    mutations: Arc<AtomicU64>,
}

impl HandleTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Root `addr`; the root lives as long as the returned handle
    pub fn create(&self, addr: Address) -> Handle {
        let slot = Arc::new(RootSlot::new(addr));
        let mut slots = self.slots.write();
        if slots.len() >= 64 && slots.len() == slots.capacity() {
            slots.retain(|s| s.strong_count() > 0);
        }
        slots.push(Arc::downgrade(&slot));
        self.mutations.fetch_add(1, Ordering::Relaxed);
        Handle {
            slot,
            mutations: Arc::clone(&self.mutations),
        }
    }

    /// Live handles
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    /// Whether no handle is alive
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RootProvider for HandleTable {
    fn enumerate_roots(&self) -> RootIter<'_> {
        Box::new(HandleIter {
            slots: self.slots.read(),
            pos: 0,
        })
    }

    fn mutations(&self) -> Option<u64> {
        Some(self.mutations.load(Ordering::Relaxed))
    }
}

struct HandleIter<'a> {
    slots: RwLockReadGuard<'a, Vec<Weak<RootSlot>>>,
    pos: usize,
}

impl Iterator for HandleIter<'_> {
    type Item = Arc<RootSlot>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.slots.len() {
            let slot = self.slots[self.pos].upgrade();
            self.pos += 1;
            if slot.is_some() {
                return slot;
            }
        }
        None
    }
}

/// A rooted reference.
///
/// The collector updates the handle when it moves the referent, so code
/// that keeps an object across an allocation must keep it in a handle.
#[derive(Debug, Clone)]
pub struct Handle {
    slot: Arc<RootSlot>,
    mutations: Arc<AtomicU64>,
}

impl Handle {
    /// Current address of the referent
    #[inline]
    pub fn get(&self) -> Address {
        self.slot.load()
    }

    /// Point the handle at another object
    pub fn set(&self, addr: Address) {
        self.slot.store(addr);
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // The last clone going away removes a root.
        if Arc::strong_count(&self.slot) == 1 {
            self.mutations.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_handles_stop_being_roots() {
        let table = HandleTable::new();
        let a = table.create(Address::new(0x1000_0000));
        let b = table.create(Address::new(0x1000_0040));
        assert_eq!(table.enumerate_roots().count(), 2);
        drop(a);
        let roots: Vec<_> = table.enumerate_roots().map(|s| s.load()).collect();
        assert_eq!(roots, vec![b.get()]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_mutations_advance() {
        let table = HandleTable::new();
        let before = table.mutations().unwrap();
        let h = table.create(Address::NULL);
        h.set(Address::new(0x1000_0000));
        let clone = h.clone();
        drop(h);
        let after_clone_drop = table.mutations().unwrap();
        assert_eq!(after_clone_drop, before + 2);
        drop(clone);
        assert_eq!(table.mutations().unwrap(), before + 3);
    }

    #[test]
    fn test_collector_rewrites_slot() {
        let table = HandleTable::new();
        let h = table.create(Address::new(0x1000_0000));
        for slot in table.enumerate_roots() {
            slot.store(Address::new(0x2000_0000));
        }
        assert_eq!(h.get(), Address::new(0x2000_0000));
    }
}
