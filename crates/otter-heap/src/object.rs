//! Object metadata
//!
//! Object headers live beside the heap words rather than inside them: each
//! region keeps an [`ObjectMap`] from region-relative offset to
//! [`ObjectMeta`]. The first `ref_slots` words of an object are references,
//! the rest is payload. Mark state lives in the region's
//! [`MarkBitmap`](crate::bitmap::MarkBitmap).

use crate::error::{GcError, GcResult};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Tri-color mark state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Not reached (garbage once marking completes)
    White = 0,
    /// Reached, fields not yet scanned
    Gray = 1,
    /// Reached and scanned
    Black = 2,
}

/// Per-object header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Granted block size in bytes
    pub size: u32,
    /// Number of leading reference words
    pub ref_slots: u32,
    /// Minor collections survived
    pub age: u8,
}

impl ObjectMeta {
    /// Header for a freshly allocated object. Fails if either field does
    /// not fit the header.
    pub fn new(size: usize, ref_slots: usize) -> GcResult<Self> {
        let layout = || GcError::InvalidLayout { size, ref_slots };
        Ok(Self {
            size: u32::try_from(size).map_err(|_| layout())?,
            ref_slots: u32::try_from(ref_slots).map_err(|_| layout())?,
            age: 0,
        })
    }

    /// Same header with `age`
    pub fn with_age(self, age: u8) -> Self {
        Self { age, ..self }
    }

    /// Block size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Reference slot count
    #[inline]
    pub fn ref_slots(&self) -> usize {
        self.ref_slots as usize
    }
}

/// Offset-ordered object headers of one region. Offsets fit `u32`
/// because `GcConfig::validate` caps `region_size` at `u32::MAX`.
#[derive(Debug, Default)]
pub struct ObjectMap {
    objects: BTreeMap<u32, ObjectMeta>,
    bytes: usize,
}

impl ObjectMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an object at `offset`
    pub fn insert(&mut self, offset: usize, meta: ObjectMeta) {
        if let Some(previous) = self.objects.insert(offset as u32, meta) {
            self.bytes -= previous.size();
        }
        self.bytes += meta.size();
    }

    /// Forget the object at `offset`
    pub fn remove(&mut self, offset: usize) -> Option<ObjectMeta> {
        let meta = self.objects.remove(&(offset as u32))?;
        self.bytes -= meta.size();
        Some(meta)
    }

    /// Header of the object starting at `offset`
    pub fn get(&self, offset: usize) -> Option<ObjectMeta> {
        self.objects.get(&(offset as u32)).copied()
    }

    /// Mutable header of the object starting at `offset`
    pub fn get_mut(&mut self, offset: usize) -> Option<&mut ObjectMeta> {
        self.objects.get_mut(&(offset as u32))
    }

    /// The object whose extent contains `offset`
    pub fn containing(&self, offset: usize) -> Option<(usize, ObjectMeta)> {
        let (&start, meta) = self
            .objects
            .range((Bound::Unbounded, Bound::Included(offset as u32)))
            .next_back()?;
        let start = start as usize;
        (offset < start + meta.size()).then_some((start, *meta))
    }

    /// Objects in offset order
    pub fn iter(&self) -> impl Iterator<Item = (usize, ObjectMeta)> + '_ {
        self.objects.iter().map(|(&off, &meta)| (off as usize, meta))
    }

    /// Keep only the objects for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(usize, &ObjectMeta) -> bool) {
        let mut bytes = 0;
        self.objects.retain(|&off, meta| {
            let kept = keep(off as usize, meta);
            if kept {
                bytes += meta.size();
            }
            kept
        });
        self.bytes = bytes;
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the map has no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Bytes covered by objects
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Drop every header
    pub fn clear(&mut self) {
        self.objects.clear();
        self.bytes = 0;
    }

    /// Take every header, leaving the map empty
    pub fn take(&mut self) -> Vec<(usize, ObjectMeta)> {
        let taken = self.iter().collect();
        self.clear();
        taken
    }
}
