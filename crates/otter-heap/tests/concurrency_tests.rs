//! Concurrency tests
//!
//! Safepoint exclusion, concurrent frees and mutators racing collections.

use otter_heap::{
    Address, CollectionKind, FreeListAllocator, GcConfig, GenerationTag, Handle, Heap, Mutator,
    RegionTable, SafepointCoordinator,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_concurrent_adjacent_frees_coalesce() {
    let config = GcConfig::small().with_region_size(8192);
    for _ in 0..100 {
        let table = Arc::new(RegionTable::new(&config).unwrap());
        let alloc = FreeListAllocator::new(GenerationTag::Old, table, config.adaptive, 1);
        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        let _guard = alloc.allocate(64).unwrap();

        let start = Barrier::new(2);
        thread::scope(|s| {
            for block in [a, b] {
                let (alloc, start) = (&alloc, &start);
                s.spawn(move || {
                    start.wait();
                    alloc.free(block.address, block.size).unwrap();
                });
            }
        });

        assert_eq!(alloc.total_free_bytes(), 128);
        assert_eq!(alloc.largest_free_chunk(), 128);
        assert!(alloc.verify().is_ok());
    }
}

#[test]
fn test_safepoint_requests_are_mutually_exclusive() {
    let coordinator = SafepointCoordinator::new(Some(Duration::from_secs(10)));
    let active = AtomicUsize::new(0);
    let overlaps = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let (requesters, rounds) = (6, 50);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let state = coordinator.register();
                while !stop.load(Ordering::Acquire) {
                    coordinator.poll(&state);
                    thread::yield_now();
                }
                coordinator.unregister(&state);
            });
        }

        let handles: Vec<_> = (0..requesters)
            .map(|_| {
                s.spawn(|| {
                    for _ in 0..rounds {
                        let token = coordinator.request_safepoint().unwrap();
                        if active.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(coordinator.is_active());
                        thread::yield_now();
                        active.fetch_sub(1, Ordering::SeqCst);
                        drop(token);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        stop.store(true, Ordering::Release);
    });

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(!coordinator.is_active());
    assert_eq!(coordinator.stats().safepoints, (requesters * rounds) as u64);
}

#[test]
fn test_concurrent_allocations_do_not_overlap() {
    let heap = Heap::new(GcConfig::small()).unwrap();
    let per_thread = 200;
    let blocks: Vec<Vec<Address>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                s.spawn(move || {
                    let m = heap.attach();
                    (0..per_thread)
                        .map(|_| m.allocate(24, 0).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(heap.stats().collections, 0);
    let mut all: Vec<Address> = blocks.into_iter().flatten().collect();
    all.sort();
    for pair in all.windows(2) {
        assert!(pair[0].offset(24) <= pair[1], "{} overlaps {}", pair[0], pair[1]);
    }
    heap.verify().unwrap();
}

fn build_list(m: &Mutator, tag: u64, n: usize) -> Handle {
    let head = m.handle(Address::NULL);
    for i in (0..n).rev() {
        let node = m.allocate(32, 1).unwrap();
        m.write_ref(node, 0, head.get()).unwrap();
        m.write_payload(node, 0, tag * 1000 + i as u64).unwrap();
        head.set(node);
    }
    head
}

fn list_values(m: &Mutator, head: &Handle) -> Vec<u64> {
    let mut values = Vec::new();
    let mut node = head.get();
    while !node.is_null() {
        values.push(m.read_payload(node, 0).unwrap());
        node = m.read_ref(node, 0).unwrap();
    }
    values
}

fn churn(heap: &Heap, tag: u64, done: &AtomicUsize) {
    let m = heap.attach();
    let list = build_list(&m, tag, 30);
    for round in 0..400 {
        m.allocate(48, 0).unwrap();
        if round % 50 == 0 {
            // Old-to-young and old-to-old edges exercised under marking.
            let tenured = m.allocate_tenured(64, 1).unwrap();
            m.write_ref(tenured, 0, list.get()).unwrap();
        }
        m.safepoint_poll();
    }
    let expected: Vec<u64> = (0..30).map(|i| tag * 1000 + i).collect();
    assert_eq!(list_values(&m, &list), expected);
    done.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_mutators_keep_lists_across_concurrent_collections() {
    let heap = Heap::new(GcConfig::small()).unwrap();
    let done = AtomicUsize::new(0);
    let mutators = 3;

    thread::scope(|s| {
        for tag in 0..mutators {
            let (heap, done) = (&heap, &done);
            s.spawn(move || churn(heap, tag as u64, done));
        }
        let kinds = [CollectionKind::Major, CollectionKind::Minor, CollectionKind::Full];
        let mut i = 0;
        while done.load(Ordering::SeqCst) < mutators && i < 30 {
            heap.collect(kinds[i % kinds.len()]).unwrap();
            i += 1;
        }
    });

    assert_eq!(done.load(Ordering::SeqCst), mutators);
    assert!(heap.stats().collections > 0);
    heap.verify().unwrap();
}

#[test]
fn test_background_cycles_race_mutators() {
    let heap = Heap::new(GcConfig::small().with_background_marking(true)).unwrap();
    let done = AtomicUsize::new(0);
    let mutators = 2;

    thread::scope(|s| {
        for tag in 0..mutators {
            let (heap, done) = (&heap, &done);
            s.spawn(move || churn(heap, tag as u64, done));
        }
        while done.load(Ordering::SeqCst) < mutators {
            heap.request_concurrent_cycle().unwrap();
            thread::sleep(Duration::from_millis(2));
        }
    });

    let mut waited = 0;
    while heap.concurrent_cycle_pending() && waited < 500 {
        thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    assert!(!heap.concurrent_cycle_pending());
    assert!(heap.stats().major_collections > 0);
    heap.verify().unwrap();
}
