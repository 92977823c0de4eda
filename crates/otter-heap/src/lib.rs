//! # Otter Heap
//!
//! Region-based generational heap with segregated free lists and
//! concurrent marking.
//!
//! ## Design
//!
//! - **Regions**: the reserved range is cut into fixed-size regions, each
//!   tagged free, eden, survivor or old
//! - **Allocation**: per-space bump allocation plus size-class free lists
//!   with eager coalescing and an adaptive split policy
//! - **Young generation**: copying scavenge driven by roots and remembered
//!   sets; survivors age and are promoted past the tenuring threshold
//! - **Old generation**: concurrent tri-color marking with a hybrid
//!   SATB/insertion barrier, sweep into free chunks, sliding compaction
//! - **Safepoints**: RAII tokens stop mutators for the non-concurrent phases
//!
//! ```ignore
//! let heap = Heap::new(GcConfig::default())?;
//! let mutator = heap.attach();
//! let node = mutator.allocate(32, 1)?;
//! let root = mutator.handle(node);
//! mutator.collect(CollectionKind::Minor)?;
//! assert!(heap.object(root.get()).is_some());
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod barrier;
pub mod bitmap;
pub mod collector;
mod compact;
pub mod config;
pub mod error;
pub mod free_list;
pub mod generation;
pub mod heap;
pub mod marker;
pub mod object;
pub mod region;
pub mod remset;
pub mod roots;
pub mod safepoint;
mod sweep;

pub use address::{Address, MIN_CHUNK_SIZE, WORD_SIZE};
pub use allocator::{Block, FreeListAllocator};
pub use collector::{CollectionKind, CollectionReport, CollectorState, GcCause, GcStats, PhaseTransition};
pub use config::{AdaptivePolicy, BarrierMode, GcConfig};
pub use error::{GcError, GcResult};
pub use free_list::{AdaptiveFreeList, FreeChunk, FreeList, FreeListStats};
pub use generation::{Generations, MinorOutcome};
pub use heap::{Heap, HeapSnapshot, Mutator, ObjectInfo, SpaceTelemetry};
pub use marker::{MarkPhase, WorkerPolicy};
pub use object::MarkColor;
pub use region::{GenerationTag, HeapRegion, RegionTable, RegionTelemetry};
pub use roots::{Handle, HandleTable, RootIter, RootProvider, RootSlot};
pub use safepoint::{SafepointCoordinator, SafepointToken};
