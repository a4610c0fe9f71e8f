//! Real-storage allocator behaviour through the public API.

mod common;

use realcore::ErrorKind;
use realcore::config::INITIAL_DESCRIPTORS;
use realcore::kernel::mm::region::HEAD_BLOCK_SIZE;
use realcore::kernel::mm::{BlockState, PhysAddr};

const REGION: usize = 32 * 1024;

fn assert_invariants(memory: &realcore::kernel::mm::RealMemory) {
    let blocks = memory.blocks(0).unwrap();
    let total: usize = blocks.iter().map(|b| b.size).sum();
    assert_eq!(total, REGION);
    for pair in blocks.windows(2) {
        assert_eq!(pair[0].addr.as_usize() + pair[0].size, pair[1].addr.as_usize());
        assert!(
            !(pair[0].state == BlockState::Free && pair[1].state == BlockState::Free),
            "adjacent free blocks at {}",
            pair[1].addr
        );
    }
}

#[test]
fn first_fit_reuses_freed_block() {
    let (memory, _backing) = common::memory(REGION);
    let end = common::BASE + REGION;

    let a = memory.alloc(100, 0).unwrap();
    assert!(a.as_usize() >= common::BASE && a.as_usize() + 100 <= end);
    let b = memory.alloc(50, 16).unwrap();
    assert!(b.is_aligned(16));
    assert!(b.as_usize() >= a.as_usize() + 100);
    assert_invariants(&memory);

    memory.free(a);
    assert_invariants(&memory);
    assert_eq!(memory.alloc(100, 0).unwrap(), a);
    assert_invariants(&memory);
}

#[test]
fn freeing_everything_leaves_one_free_block() {
    let (memory, _backing) = common::memory(REGION);
    let addrs: Vec<PhysAddr> = [100, 4000, 7, 512, 1024, 33]
        .iter()
        .enumerate()
        .map(|(i, &size)| memory.alloc(size, if i % 2 == 0 { 0 } else { 64 }).unwrap())
        .collect();
    assert_invariants(&memory);

    for addr in addrs.iter().rev().step_by(2).chain(addrs.iter().step_by(2)) {
        memory.free(*addr);
        assert_invariants(&memory);
    }

    let blocks = memory.blocks(0).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].state, BlockState::Used);
    assert_eq!(blocks[1].state, BlockState::Free);
    assert_eq!(blocks[1].size, REGION - HEAD_BLOCK_SIZE);
}

#[test]
fn many_small_allocations_outgrow_the_initial_descriptors() {
    let (memory, _backing) = common::memory(REGION);
    let start = memory.get_stats();

    let addrs: Vec<PhysAddr> = (0..INITIAL_DESCRIPTORS + 8)
        .map(|i| {
            memory
                .alloc(16, 0)
                .unwrap_or_else(|e| panic!("alloc #{} failed: {}", i, e))
        })
        .collect();
    assert_invariants(&memory);
    for pair in addrs.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }

    for addr in addrs {
        memory.free(addr);
        assert_invariants(&memory);
    }
    assert_eq!(memory.get_stats(), start);
    assert_eq!(memory.blocks(0).unwrap().len(), 2);
}

#[test]
fn realloc_keeps_the_common_prefix() {
    let (memory, _backing) = common::memory(REGION);
    let a = memory.alloc(64, 0).unwrap();
    let pattern: Vec<u8> = (0..64).collect();
    memory.write_bytes(a, &pattern).unwrap();
    // 直後を塞いでその場での拡張をできなくする
    let _pin = memory.alloc(16, 0).unwrap();

    let grown = memory.realloc(Some(a), 200, 0).unwrap().unwrap();
    let mut out = vec![0u8; 64];
    memory.read_bytes(grown, &mut out).unwrap();
    assert_eq!(out, pattern);

    let shrunk = memory.realloc(Some(grown), 10, 0).unwrap().unwrap();
    let mut out = vec![0u8; 10];
    memory.read_bytes(shrunk, &mut out).unwrap();
    assert_eq!(out, &pattern[..10]);
    assert_invariants(&memory);
}

#[test]
fn stats_are_idempotent_and_track_usage() {
    let (memory, _backing) = common::memory(REGION);
    let first = memory.get_stats();
    assert_eq!(first, memory.get_stats());
    assert_eq!(first.total(), REGION);
    assert_eq!(first.used.as_usize(), HEAD_BLOCK_SIZE);

    let a = memory.alloc(1000, 0).unwrap();
    let during = memory.get_stats();
    assert_eq!(during, memory.get_stats());
    assert!(during.used.as_usize() >= HEAD_BLOCK_SIZE + 1000);

    memory.free(a);
    assert_eq!(memory.get_stats(), first);
}

#[test]
fn exhaustion_is_reported_not_fatal() {
    let (memory, _backing) = common::memory(REGION);
    let err = memory.alloc(REGION, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(memory.alloc(REGION - HEAD_BLOCK_SIZE, 0).is_ok());
    assert_eq!(memory.alloc(1, 0).unwrap_err().kind(), ErrorKind::Allocation);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_stops_the_kernel() {
    let (memory, _backing) = common::memory(REGION);
    let a = memory.alloc(128, 0).unwrap();
    let _b = memory.alloc(128, 0).unwrap();
    memory.free(a);
    memory.free(a);
}
