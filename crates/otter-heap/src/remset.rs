//! Remembered sets
//!
//! Each region remembers the slots in other regions that point into it.
//! Entries are slot addresses, recorded by the write barrier and validated
//! when the collector consumes them, so stale entries are harmless.

use crate::address::Address;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

/// Incoming cross-region reference slots of one region
#[derive(Debug, Default)]
pub struct RememberedSet {
    slots: Mutex<FxHashSet<Address>>,
}

impl RememberedSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a slot; returns true if it was new
    pub fn add(&self, slot: Address) -> bool {
        self.slots.lock().insert(slot)
    }

    /// Forget a slot
    pub fn remove(&self, slot: Address) -> bool {
        self.slots.lock().remove(&slot)
    }

    /// Whether `slot` is remembered
    pub fn contains(&self, slot: Address) -> bool {
        self.slots.lock().contains(&slot)
    }

    /// Copy of the current entries
    pub fn snapshot(&self) -> Vec<Address> {
        self.slots.lock().iter().copied().collect()
    }

    /// Keep only the entries for which `keep` returns true
    pub fn retain(&self, mut keep: impl FnMut(Address) -> bool) {
        self.slots.lock().retain(|&slot| keep(slot));
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remembered_set_dedups() {
        let set = RememberedSet::new();
        let slot = Address::new(0x2000);
        assert!(set.add(slot));
        assert!(!set.add(slot));
        assert_eq!(set.len(), 1);
        set.retain(|s| s != slot);
        assert!(set.is_empty());
    }
}
