//! Free-list allocator tests
//!
//! Partition and coalescing properties of a single space, driven through
//! the public allocator API.

use otter_heap::{AdaptivePolicy, Address, Block, FreeListAllocator, GcConfig, GcError, GenerationTag, RegionTable};
use proptest::prelude::*;
use std::sync::Arc;

fn space(region_size: usize, budget: usize) -> FreeListAllocator {
    let config = GcConfig::small().with_region_size(region_size);
    let table = Arc::new(RegionTable::new(&config).unwrap());
    FreeListAllocator::new(GenerationTag::Old, table, AdaptivePolicy::default(), budget)
}

#[test]
fn test_free_odd_objects_then_allocate_double() {
    let alloc = space(8192, 1);
    let blocks: Vec<Block> = (0..100).map(|_| alloc.allocate(64).unwrap()).collect();
    let base = blocks[0].address;
    for block in blocks.iter().skip(1).step_by(2) {
        alloc.free(block.address, 64).unwrap();
    }
    // Object 99 touched top, so the bump area grew back over it.
    assert_eq!(alloc.total_free_bytes(), 49 * 64);

    let wide = alloc.allocate(128).unwrap();
    assert_eq!(wide.address, base.offset(99 * 64));
    assert!(alloc.verify().is_ok());
}

#[test]
fn test_full_region_needs_coalesced_chunk() {
    let alloc = space(8192, 1);
    let blocks: Vec<Block> = (0..128).map(|_| alloc.allocate(64).unwrap()).collect();
    assert_eq!(alloc.bump_remaining(), 0);
    for block in blocks.iter().skip(1).step_by(2) {
        alloc.free(block.address, 64).unwrap();
    }
    // Isolated 64-byte holes cannot hold 128 bytes.
    assert_eq!(alloc.allocate(128), Err(GcError::OutOfMemory { requested: 128 }));
    assert_eq!(alloc.largest_failed_request(), 128);

    // Freeing object 2 joins holes 1, 2 and 3.
    alloc.free(blocks[2].address, 64).unwrap();
    assert_eq!(alloc.largest_free_chunk(), 192);
    let wide = alloc.allocate(128).unwrap();
    assert_eq!(wide.address, blocks[1].address);
    assert_eq!(wide.size, 128);
    assert!(alloc.verify().is_ok());
}

#[test]
fn test_adjacent_frees_merge_in_either_order() {
    for reversed in [false, true] {
        let alloc = space(8192, 1);
        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        let _guard = alloc.allocate(64).unwrap();
        let (first, second) = if reversed { (b, a) } else { (a, b) };
        alloc.free(first.address, 64).unwrap();
        alloc.free(second.address, 64).unwrap();
        assert_eq!(alloc.total_free_bytes(), 128);
        assert_eq!(alloc.largest_free_chunk(), 128);
        let stats = alloc.free_list_stats();
        assert_eq!(stats.iter().map(|s| s.count).sum::<usize>(), 1);
        assert!(alloc.verify().is_ok());
    }
}

#[test]
fn test_double_free_rejected() {
    let alloc = space(8192, 1);
    let a = alloc.allocate(64).unwrap();
    let _b = alloc.allocate(64).unwrap();
    alloc.free(a.address, 64).unwrap();
    assert_eq!(alloc.free(a.address, 64), Err(GcError::InvalidAddress(a.address)));
    assert_eq!(
        alloc.free(Address::new(0x42), 64),
        Err(GcError::InvalidAddress(Address::new(0x42)))
    );
}

#[test]
fn test_free_overlapping_a_free_chunk_rejected() {
    let alloc = space(8192, 1);
    let a = alloc.allocate(64).unwrap();
    let b = alloc.allocate(64).unwrap();
    let c = alloc.allocate(64).unwrap();
    let _guard = alloc.allocate(64).unwrap();
    alloc.free(b.address, 64).unwrap();

    // Would swallow the start of the free chunk at `b`.
    assert_eq!(alloc.free(a.address, 96), Err(GcError::InvalidAddress(a.address)));
    // Starts inside the free chunk at `b`.
    assert_eq!(
        alloc.free(b.address.offset(32), 64),
        Err(GcError::InvalidAddress(b.address.offset(32)))
    );
    assert_eq!(alloc.total_free_bytes(), 64);
    assert!(alloc.verify().is_ok());

    alloc.free(a.address, 64).unwrap();
    alloc.free(c.address, 64).unwrap();
    assert_eq!(alloc.largest_free_chunk(), 192);
    assert!(alloc.verify().is_ok());
}

#[test]
fn test_oversized_request_fails_without_panic() {
    let alloc = space(8192, 1);
    for size in [usize::MAX, usize::MAX - 3, 8192 + 1] {
        assert_eq!(alloc.allocate(size), Err(GcError::OutOfMemory { requested: size }));
    }
    assert_eq!(alloc.largest_failed_request(), 0);
    assert!(alloc.allocate(8192).is_ok());
    let stray = Address::new(0x1000);
    assert_eq!(alloc.free(stray, usize::MAX), Err(GcError::InvalidAddress(stray)));
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            // Multiples of 16 keep every retired tail trackable as a chunk.
            3 => (1usize..38).prop_map(|n| Op::Alloc(n * 16)),
            2 => any::<usize>().prop_map(Op::Free),
        ],
        1..200,
    )
}

proptest! {
    #[test]
    fn prop_live_blocks_and_chunks_partition_space(ops in ops()) {
        let alloc = space(16 * 1024, 2);
        let mut live: Vec<Block> = Vec::new();
        for op in ops {
            match op {
                Op::Alloc(size) => match alloc.allocate(size) {
                    Ok(block) => {
                        prop_assert!(block.size >= size);
                        live.push(block);
                    }
                    Err(err) => prop_assert!(err.is_allocation_failure()),
                },
                Op::Free(pick) if !live.is_empty() => {
                    let block = live.swap_remove(pick % live.len());
                    prop_assert!(alloc.free(block.address, block.size).is_ok());
                }
                Op::Free(_) => {}
            }

            let live_bytes: usize = live.iter().map(|b| b.size).sum();
            prop_assert_eq!(alloc.used(), live_bytes);
            prop_assert!(alloc.verify().is_ok());
        }

        let mut sorted = live.clone();
        sorted.sort_by_key(|b| b.address);
        for pair in sorted.windows(2) {
            prop_assert!(pair[0].address.offset(pair[0].size) <= pair[1].address);
        }
    }

    #[test]
    fn prop_freeing_everything_restores_bump_area(
        sizes in prop::collection::vec(16usize..512, 1..40),
        seed in any::<u64>(),
    ) {
        let alloc = space(16 * 1024, 1);
        let mut blocks: Vec<Block> = sizes.iter().filter_map(|&s| alloc.allocate(s).ok()).collect();
        let capacity = alloc.capacity();

        // Deterministic shuffle from the seed.
        let mut state = seed | 1;
        for i in (1..blocks.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            blocks.swap(i, (state % (i as u64 + 1)) as usize);
        }
        for block in blocks {
            prop_assert!(alloc.free(block.address, block.size).is_ok());
        }
        prop_assert_eq!(alloc.total_free_bytes(), 0);
        prop_assert_eq!(alloc.bump_remaining(), capacity);
        prop_assert!(alloc.verify().is_ok());
    }
}
