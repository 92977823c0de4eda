//! Heap addresses and alignment helpers

use std::fmt;

/// Size of a heap word in bytes. Reference slots are one word each.
pub const WORD_SIZE: usize = 8;

/// Smallest block the allocator hands out and the smallest free chunk it tracks.
pub const MIN_CHUNK_SIZE: usize = 16;

/// Base of the reserved heap range. Kept non-zero so `Address::NULL` never
/// names a heap word.
pub const HEAP_BASE: usize = 0x1000_0000;

/// An address inside the reserved heap range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(usize);

impl Address {
    /// The null reference
    pub const NULL: Address = Address(0);

    /// Wrap a raw address
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw address value
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Raw value as stored in a reference slot
    #[inline]
    pub const fn as_word(self) -> u64 {
        self.0 as u64
    }

    /// Decode a reference slot value
    #[inline]
    pub const fn from_word(word: u64) -> Self {
        Self(word as usize)
    }

    /// Whether this is the null reference
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Distance in bytes from `base` up to this address
    #[inline]
    pub const fn diff(self, base: Address) -> usize {
        self.0 - base.0
    }

    /// Whether the address is word aligned
    #[inline]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD_SIZE == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Round `size` up to a multiple of `align` (a power of two); `None` on
/// overflow
#[inline]
pub const fn align_up(size: usize, align: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(padded) => Some(padded & !(align - 1)),
        None => None,
    }
}

/// Block size the allocator grants for a request of `size` bytes
#[inline]
pub const fn block_size(size: usize) -> Option<usize> {
    match align_up(size, WORD_SIZE) {
        Some(aligned) if aligned < MIN_CHUNK_SIZE => Some(MIN_CHUNK_SIZE),
        aligned => aligned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_rounding() {
        assert_eq!(block_size(0), Some(MIN_CHUNK_SIZE));
        assert_eq!(block_size(1), Some(MIN_CHUNK_SIZE));
        assert_eq!(block_size(16), Some(16));
        assert_eq!(block_size(17), Some(24));
        assert_eq!(block_size(64), Some(64));
    }

    #[test]
    fn test_block_size_overflow() {
        assert_eq!(block_size(usize::MAX), None);
        assert_eq!(block_size(usize::MAX - 3), None);
        assert_eq!(align_up(usize::MAX - 7, WORD_SIZE), Some(usize::MAX - 7));
    }

    #[test]
    fn test_address_arithmetic() {
        let a = Address::new(HEAP_BASE);
        let b = a.offset(64);
        assert_eq!(b.diff(a), 64);
        assert!(b.is_word_aligned());
        assert!(!a.is_null());
        assert!(Address::NULL.is_null());
        assert_eq!(Address::from_word(b.as_word()), b);
    }
}
