//! Side mark bitmap
//!
//! One bit per heap word in two planes: `marked` (reached) and `scanned`
//! (fields visited). White is neither, gray is marked only, black is both.

use crate::address::WORD_SIZE;
use crate::object::MarkColor;
use std::sync::atomic::{AtomicU64, Ordering};

const BITS: usize = 64;

/// Tri-color mark bitmap covering one region
pub struct MarkBitmap {
    marked: Box<[AtomicU64]>,
    scanned: Box<[AtomicU64]>,
}

impl MarkBitmap {
    /// Bitmap for a region of `region_size` bytes
    pub fn new(region_size: usize) -> Self {
        let words = (region_size / WORD_SIZE).div_ceil(BITS);
        Self {
            marked: (0..words).map(|_| AtomicU64::new(0)).collect(),
            scanned: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn locate(offset: usize) -> (usize, u64) {
        let granule = offset / WORD_SIZE;
        (granule / BITS, 1u64 << (granule % BITS))
    }

    /// Set the mark bit; returns true if the object was white
    #[inline]
    pub fn mark(&self, offset: usize) -> bool {
        let (word, bit) = Self::locate(offset);
        self.marked[word].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Whether the object has been reached
    #[inline]
    pub fn is_marked(&self, offset: usize) -> bool {
        let (word, bit) = Self::locate(offset);
        self.marked[word].load(Ordering::Acquire) & bit != 0
    }

    /// Record that the object's fields have been visited
    #[inline]
    pub fn set_scanned(&self, offset: usize) {
        let (word, bit) = Self::locate(offset);
        self.scanned[word].fetch_or(bit, Ordering::AcqRel);
    }

    /// Whether the object's fields have been visited
    #[inline]
    pub fn is_scanned(&self, offset: usize) -> bool {
        let (word, bit) = Self::locate(offset);
        self.scanned[word].load(Ordering::Acquire) & bit != 0
    }

    /// Mark and scan in one step (black allocation)
    #[inline]
    pub fn blacken(&self, offset: usize) {
        self.mark(offset);
        self.set_scanned(offset);
    }

    /// Current color of the object at `offset`
    pub fn color(&self, offset: usize) -> MarkColor {
        match (self.is_marked(offset), self.is_scanned(offset)) {
            (false, _) => MarkColor::White,
            (true, false) => MarkColor::Gray,
            (true, true) => MarkColor::Black,
        }
    }

    /// Reset every object to white
    pub fn clear(&self) {
        for word in self.marked.iter().chain(self.scanned.iter()) {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Number of marked granules
    pub fn marked_count(&self) -> usize {
        self.marked
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

impl std::fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkBitmap")
            .field("marked", &self.marked_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_transitions() {
        let bitmap = MarkBitmap::new(4096);
        assert_eq!(bitmap.color(64), MarkColor::White);
        assert!(bitmap.mark(64));
        assert!(!bitmap.mark(64));
        assert_eq!(bitmap.color(64), MarkColor::Gray);
        bitmap.set_scanned(64);
        assert_eq!(bitmap.color(64), MarkColor::Black);
        assert_eq!(bitmap.color(72), MarkColor::White);
    }

    #[test]
    fn test_clear_whitens_everything() {
        let bitmap = MarkBitmap::new(4096);
        bitmap.blacken(0);
        bitmap.blacken(4088);
        assert_eq!(bitmap.marked_count(), 2);
        bitmap.clear();
        assert_eq!(bitmap.marked_count(), 0);
        assert_eq!(bitmap.color(4088), MarkColor::White);
    }
}
