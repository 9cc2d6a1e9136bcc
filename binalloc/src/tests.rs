// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cmp;
use std::env;
use std::ptr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::{
    AllocatorConfigBuilder, BinnedAllocator, PanicHandler, SizeClassTable, StatsSink,
};

fn config() -> AllocatorConfigBuilder {
    // Keep each test's address space reservation modest.
    AllocatorConfigBuilder::default().max_memory_per_block_size(16 << 20)
}

fn panicking(builder: AllocatorConfigBuilder) -> BinnedAllocator {
    BinnedAllocator::with_handler(builder.build().unwrap(), Arc::new(PanicHandler))
}

fn test_iters(default: usize) -> usize {
    match env::var("BINALLOC_TEST_ITERS") {
        Ok(val) => val.parse().unwrap_or(default),
        Err(_) => default,
    }
}

unsafe fn fill(ptr: *mut u8, size: usize, tag: u8) {
    ptr::write_bytes(ptr, tag, size);
}

unsafe fn check(ptr: *const u8, size: usize, tag: u8) {
    for i in 0..size {
        assert_eq!(*ptr.add(i), tag, "byte {} of {:?} (size {})", i, ptr, size);
    }
}

#[test]
fn alignment_and_size() {
    let _ = env_logger::try_init();
    let heap = panicking(config());
    let table = SizeClassTable::new(heap.config());
    let page = heap.config().page_size;
    let sizes = [
        0, 1, 7, 16, 17, 24, 48, 100, 255, 256, 500, 1000, 1500, 2048, 3000, 4096, 5000, 8000,
        12000, 16384, 20000, 32767, 32768,
    ];
    let mut align = 1;
    while align <= page {
        for &size in sizes.iter() {
            let p = heap.malloc(size, align);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "size {} align {}", size, align);
            let got = heap.get_allocation_size(p).unwrap();
            match table.index_for(cmp::max(size, 1), align) {
                Some(i) => assert_eq!(got, table.get(i).block_size as usize),
                None => assert!(got >= size),
            }
            assert!(got >= size);
            unsafe {
                fill(p, size, 0xa5);
                heap.free(p);
            }
        }
        align *= 2;
    }
}

#[test]
fn small_sizes_report_their_class() {
    let heap = panicking(config());
    let table = SizeClassTable::new(heap.config());
    let max = heap.config().max_small_pool_size;
    for size in (1..=max).step_by(7).chain(Some(max)) {
        let p = heap.malloc(size, 16);
        let class = table.get(table.index_for_size(size).unwrap()).block_size as usize;
        assert_eq!(heap.get_allocation_size(p), Some(class));
        assert!(class >= size);
        unsafe { heap.free(p) };
    }
    assert_eq!(heap.get_allocation_size(ptr::null()), None);
}

#[test]
#[should_panic(expected = "UnrecognizedPointer")]
fn large_allocation_then_double_free() {
    let _ = env_logger::try_init();
    let heap = panicking(config());
    let size = heap.config().max_small_pool_size + 1;
    let p = heap.malloc(size, 16);

    assert!(heap.pool_stats().iter().all(|p| p.committed_slabs == 0));
    let stats = heap.stats();
    assert_eq!(stats.large_allocations, 1);
    assert_eq!(stats.committed_slabs, 0);
    let got = heap.get_allocation_size(p).unwrap();
    assert!(got >= size);
    assert_eq!(got, stats.large_committed_bytes);
    assert_eq!(got % heap.config().page_size, 0);

    unsafe { heap.free(p) };
    assert_eq!(heap.stats().large_allocations, 0);
    unsafe { heap.free(p) };
}

#[test]
#[should_panic(expected = "UnrecognizedPointer")]
fn interior_pointer_is_fatal() {
    let heap = panicking(config());
    let p = heap.malloc(64, 16);
    unsafe { heap.free(p.add(16)) };
}

#[test]
#[should_panic(expected = "UnrecognizedPointer")]
fn foreign_pointer_is_fatal() {
    let heap = panicking(config());
    let mut local = [0u8; 64];
    unsafe { heap.free(local.as_mut_ptr()) };
}

#[test]
#[should_panic(expected = "CorruptionDetected")]
fn scribbled_free_block_is_fatal() {
    let heap = panicking(config().per_thread_caches(false));
    let a = heap.malloc(64, 16);
    let b = heap.malloc(64, 16);
    unsafe {
        heap.free(a);
        // Overwrite the free-list header the allocator left in the freed block.
        ptr::write_bytes(a, 0xff, 16);
    }
    let _ = heap.malloc(64, 16);
    let _ = b;
}

#[test]
#[should_panic(expected = "AlignmentTooLarge")]
fn alignment_above_granularity_is_fatal() {
    let heap = panicking(config());
    let granularity = heap.config().commit_granularity;
    heap.malloc(100, granularity * 2);
}

#[test]
fn large_alignment_up_to_granularity() {
    let page = sysconf::page::pagesize();
    let heap = panicking(config().commit_granularity(page * 4));
    let p = heap.malloc(100, page * 2);
    assert_eq!(p as usize % (page * 2), 0);
    assert!(heap.get_allocation_size(p).unwrap() >= 100);
    assert_eq!(heap.stats().large_allocations, 1);
    unsafe { heap.free(p) };
}

#[test]
#[should_panic(expected = "OutOfMemory")]
fn huge_request_is_out_of_memory() {
    let page = sysconf::page::pagesize();
    let heap = panicking(config().commit_granularity(page * 4));
    heap.malloc(usize::MAX - 100, 16);
}

#[test]
#[should_panic(expected = "OutOfMemory")]
fn request_rounding_past_usize_is_out_of_memory() {
    let heap = panicking(config());
    heap.malloc(usize::MAX, 1);
}

#[test]
#[should_panic(expected = "InvalidConfig")]
fn config_edited_after_build_is_fatal() {
    let mut c = config().build().unwrap();
    c.commit_granularity = 3000;
    BinnedAllocator::with_handler(c, Arc::new(PanicHandler));
}

#[test]
#[should_panic(expected = "InvalidConfig")]
fn page_size_below_the_backend_page_is_fatal() {
    let page = sysconf::page::pagesize();
    panicking(config().page_size(page / 2));
}

#[test]
fn reallocation_preserves_contents() {
    let _ = env_logger::try_init();
    let heap = panicking(config());
    let max = heap.config().max_small_pool_size;
    let pairs = [
        (16, 16),
        (16, 17),
        (100, 50),
        (1000, 5000),
        (5000, 1000),
        (max, max + 1),
        (max + 1, max),
        (max * 3, 40),
        (40, max * 3),
        (max * 2, max * 4),
    ];
    for (i, &(s1, s2)) in pairs.iter().enumerate() {
        let tag = i as u8 + 1;
        unsafe {
            let p = heap.malloc(s1, 16);
            fill(p, s1, tag);
            let q = heap.realloc(p, s2, 16);
            assert_eq!(q as usize % 16, 0);
            check(q, cmp::min(s1, s2), tag);
            assert!(heap.get_allocation_size(q).unwrap() >= s2);
            heap.free(q);
        }
    }
    let s = heap.stats();
    assert_eq!(s.large_allocations, 0);
    assert_eq!(s.large_committed_bytes, 0);
}

#[test]
fn realloc_edge_cases() {
    let heap = panicking(config());
    unsafe {
        let p = heap.realloc(ptr::null_mut(), 24, 16);
        assert_eq!(heap.get_allocation_size(p), Some(32));
        // Same size class: the block stays put.
        assert_eq!(heap.realloc(p, 30, 16), p);
        assert!(heap.realloc(p, 0, 16).is_null());
    }
    heap.trim(true);
    assert_eq!(heap.stats().small_allocated_bytes, 0);
}

#[test]
fn large_realloc_in_place() {
    let heap = panicking(config());
    let page = heap.config().page_size;
    let max = heap.config().max_small_pool_size;
    unsafe {
        let p = heap.malloc(max + 5 * page + 100, 16);
        assert_eq!(heap.get_allocation_size(p), Some(max + 6 * page));
        fill(p, max + 2 * page, 7);

        // Shrinking gives back the tail pages.
        let q = heap.realloc(p, max + 2 * page, 16);
        assert_eq!(q, p);
        assert_eq!(heap.get_allocation_size(p), Some(max + 2 * page));
        assert_eq!(heap.stats().large_committed_bytes, max + 2 * page);
        check(p, max + 2 * page, 7);

        // Growing within the original mapping recommits them, zeroed.
        let q = heap.realloc(p, max + 6 * page, 16);
        assert_eq!(q, p);
        assert_eq!(heap.get_allocation_size(p), Some(max + 6 * page));
        check(p, max + 2 * page, 7);
        check(p.add(max + 5 * page), page, 0);

        // Growing past it moves.
        let q = heap.realloc(p, max + 7 * page, 16);
        assert_ne!(q, p);
        check(q, max + 2 * page, 7);
        assert_eq!(heap.stats().large_allocations, 1);
        heap.free(q);
    }
}

#[test]
fn malloc_zeroed_clears_reused_blocks() {
    let heap = panicking(config().per_thread_caches(false));
    let max = heap.config().max_small_pool_size;
    for &size in &[64, 1000, max, max * 2] {
        unsafe {
            let p = heap.malloc(size, 16);
            fill(p, size, 0xff);
            heap.free(p);
            let q = heap.malloc_zeroed(size, 16);
            check(q, size, 0);
            heap.free(q);
        }
    }
}

#[test]
fn reallocating_after_free_reuses_slabs() {
    let heap = panicking(config().per_thread_caches(false));
    let n = 3000;
    let mut rng = StdRng::seed_from_u64(0xb1_5eed);
    let mut ptrs: Vec<*mut u8> = (0..n).map(|_| heap.malloc(200, 16)).collect();
    let high_water = heap.stats().high_water_slabs;
    assert!(high_water > 0);
    ptrs.shuffle(&mut rng);
    for p in ptrs.drain(..) {
        unsafe { heap.free(p) };
    }
    assert_eq!(heap.stats().committed_slabs, 0);
    let ptrs: Vec<*mut u8> = (0..n).map(|_| heap.malloc(200, 16)).collect();
    assert_eq!(heap.stats().high_water_slabs, high_water);
    for p in ptrs {
        unsafe { heap.free(p) };
    }
}

#[test]
fn refilling_holes_needs_no_new_slabs() {
    let heap = panicking(config().per_thread_caches(false));
    let ptrs: Vec<*mut u8> = (0..10_000).map(|_| heap.malloc(32, 16)).collect();
    let before = heap.stats();
    assert_eq!(before.committed_slabs, before.high_water_slabs);
    let per_slab = heap
        .pool_stats()
        .into_iter()
        .find(|p| p.block_size == 32)
        .unwrap()
        .blocks_per_slab as u64;
    assert_eq!(before.committed_slabs, (10_000 + per_slab - 1) / per_slab);

    for p in ptrs.iter().step_by(2) {
        unsafe { heap.free(*p) };
    }
    let more: Vec<*mut u8> = (0..5_000).map(|_| heap.malloc(32, 16)).collect();
    let after = heap.stats();
    assert_eq!(after.high_water_slabs, before.high_water_slabs);
    assert_eq!(after.committed_slabs, before.committed_slabs);
    assert_eq!(after.small_committed_bytes_peak, before.small_committed_bytes_peak);

    for p in ptrs.iter().skip(1).step_by(2).chain(more.iter()) {
        unsafe { heap.free(*p) };
    }
    assert_eq!(heap.stats().committed_slabs, 0);
}

#[test]
fn two_threads_balance_to_zero() {
    let _ = env_logger::try_init();
    let heap = panicking(config());
    let n = test_iters(50_000);
    let threads: Vec<_> = (0..2)
        .map(|t| {
            let heap = heap.clone();
            thread::Builder::new()
                .name(format!("balance-{}", t))
                .spawn(move || {
                    let ptrs: Vec<usize> = (0..n).map(|_| heap.malloc(48, 16) as usize).collect();
                    assert!(heap.stats().small_allocated_bytes >= (n * 48) as i64);
                    for p in ptrs {
                        unsafe { heap.free(p as *mut u8) };
                    }
                })
                .unwrap()
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    let s = heap.stats();
    assert_eq!(s.small_allocated_bytes, 0);
    assert_eq!(s.thread_caches, 0);
    heap.trim(true);
    assert_eq!(heap.stats().committed_slabs, 0);
}

#[test]
fn concurrency_storm_then_trim() {
    let _ = env_logger::try_init();
    // Small bundles and a small recycler so every path gets exercised.
    let heap = panicking(config().bundle_limits(16, 4096).max_global_bundles(4));
    let max = heap.config().max_small_pool_size;
    let iters = test_iters(20_000);
    let threads: Vec<_> = (0..4u64)
        .map(|t| {
            let heap = heap.clone();
            thread::Builder::new()
                .name(format!("storm-{}", t))
                .spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    let mut live: Vec<(usize, usize, u8)> = Vec::new();
                    for i in 0..iters {
                        if live.is_empty() || rng.gen_range(0..5) < 3 {
                            let size = if rng.gen_range(0..64) == 0 {
                                rng.gen_range(max..max * 2)
                            } else {
                                rng.gen_range(1..2048)
                            };
                            let tag = (t as u8).wrapping_mul(31) ^ i as u8;
                            let p = heap.malloc(size, 16);
                            unsafe { fill(p, size, tag) };
                            live.push((p as usize, size, tag));
                        } else {
                            let idx = rng.gen_range(0..live.len());
                            let (p, size, tag) = live.swap_remove(idx);
                            unsafe {
                                check(p as *const u8, size, tag);
                                heap.free(p as *mut u8);
                            }
                        }
                    }
                    live
                })
                .unwrap()
        })
        .collect();

    let mut leftovers = Vec::new();
    for t in threads {
        leftovers.extend(t.join().unwrap());
    }
    assert!(heap.stats().high_water_slabs > 0);
    // Free what the workers left behind from this thread.
    for (p, size, tag) in leftovers {
        unsafe {
            check(p as *const u8, size, tag);
            heap.free(p as *mut u8);
        }
    }
    heap.trim(true);
    let s = heap.stats();
    assert_eq!(s.committed_slabs, 0);
    assert_eq!(s.small_committed_bytes, 0);
    assert_eq!(s.large_allocations, 0);
    assert_eq!(s.small_allocated_bytes, 0);
    assert_eq!(s.recycled_bundles, 0);
    assert_eq!(s.thread_cached_blocks, 0);
    assert!(s.small_committed_bytes_peak > 0);
}

#[test]
fn tls_cache_controls() {
    let heap = panicking(config());
    thread::spawn(move || {
        let p = heap.malloc(64, 16);
        let s = heap.stats();
        assert_eq!(s.thread_caches, 1);
        assert!(s.thread_cached_blocks > 0);
        unsafe { heap.free(p) };
        heap.flush_current_thread_cache();
        let s = heap.stats();
        assert_eq!(s.thread_cached_blocks, 0);
        assert_eq!(s.committed_slabs, 0);
        assert_eq!(s.thread_caches, 1);

        heap.clear_and_disable_tls_caches_on_current_thread();
        assert_eq!(heap.stats().thread_caches, 0);
        let p = heap.malloc(64, 16);
        let s = heap.stats();
        assert_eq!(s.thread_caches, 0);
        assert_eq!(s.small_allocated_bytes, 64);
        unsafe { heap.free(p) };
        assert_eq!(heap.stats().committed_slabs, 0);

        heap.setup_tls_caches_on_current_thread();
        assert_eq!(heap.stats().thread_caches, 1);
        let p = heap.malloc(64, 16);
        unsafe { heap.free(p) };
        assert_eq!(heap.stats().small_allocated_bytes, 0);
    })
    .join()
    .unwrap();
}

#[test]
fn caching_disabled_by_config() {
    let heap = panicking(config().per_thread_caches(false));
    let p = heap.malloc(128, 16);
    assert_eq!(heap.stats().thread_caches, 0);
    unsafe { heap.free(p) };
    // An explicit setup still turns it on for this thread.
    heap.setup_tls_caches_on_current_thread();
    let p = heap.malloc(128, 16);
    assert_eq!(heap.stats().thread_caches, 1);
    unsafe { heap.free(p) };
}

#[test]
#[should_panic(expected = "UnrecognizedPointer")]
fn size_of_block_in_decommitted_slab() {
    let heap = panicking(config().per_thread_caches(false));
    let p = heap.malloc(64, 16);
    unsafe { heap.free(p) };
    assert_eq!(heap.stats().committed_slabs, 0);
    heap.get_allocation_size(p);
}

#[test]
#[should_panic(expected = "UnrecognizedPointer")]
fn realloc_of_block_in_decommitted_slab() {
    let heap = panicking(config().per_thread_caches(false));
    let p = heap.malloc(64, 16);
    unsafe {
        heap.free(p);
        assert_eq!(heap.stats().committed_slabs, 0);
        heap.realloc(p, 100, 16);
    }
}

#[test]
#[should_panic(expected = "UnrecognizedPointer")]
fn cached_free_into_decommitted_slab() {
    let heap = panicking(config());
    let p = heap.malloc(64, 16);
    unsafe { heap.free(p) };
    heap.trim(true);
    assert_eq!(heap.stats().committed_slabs, 0);
    unsafe { heap.free(p) };
}

#[test]
fn separate_reservations_per_pool() {
    let heap = panicking(config().separate_vm_per_pool(true));
    let mut rng = StdRng::seed_from_u64(7);
    let mut live = Vec::new();
    // Every class up to 8 KiB, well inside each pool's 16 MiB range.
    for _ in 0..2000 {
        let size = rng.gen_range(1..=8192);
        let p = heap.malloc(size, 16);
        unsafe { fill(p, size, 0x3c) };
        live.push((p, size));
    }
    let size = heap.config().max_small_pool_size + 1;
    let big = heap.malloc(size, 16);
    unsafe { fill(big, size, 0x3c) };
    live.push((big, size));
    assert!(heap.stats().committed_slabs > 0);
    for (p, size) in live {
        assert!(heap.get_allocation_size(p).unwrap() >= size);
        unsafe {
            check(p, size, 0x3c);
            heap.free(p);
        }
    }
    heap.trim(true);
    assert_eq!(heap.stats().committed_slabs, 0);
}

#[test]
fn custom_block_sizes_are_served_exactly() {
    let heap = panicking(config().custom_block_sizes(&[208, 12288]));
    let p = heap.malloc(200, 16);
    assert_eq!(heap.get_allocation_size(p), Some(208));
    let q = heap.malloc(12000, 16);
    assert_eq!(heap.get_allocation_size(q), Some(12288));
    unsafe {
        heap.free(p);
        heap.free(q);
    }
}

#[test]
fn stats_reporting() {
    let heap = panicking(config());
    let p = heap.malloc(64, 16);
    let big = heap.malloc(100_000, 16);

    let mut sink: Vec<(&'static str, u64)> = Vec::new();
    heap.get_allocator_stats(&mut sink);
    let get = |name| sink.iter().find(|&&(n, _)| n == name).map(|&(_, v)| v);
    assert_eq!(get("small_allocated_bytes"), Some(64));
    assert_eq!(get("large_allocations"), Some(1));
    assert_eq!(get("large_requested_bytes"), Some(100_000));
    assert!(get("bookkeeping_bytes").unwrap() > 0);

    let mut out = String::new();
    heap.dump_allocator_stats(&mut out).unwrap();
    assert!(out.starts_with("small: 64 bytes allocated"));
    assert!(out.contains("large: 1 allocations, 100000 bytes requested"));
    assert!(out.lines().any(|l| l.trim_start().starts_with("64 ")));

    unsafe {
        heap.free(p);
        heap.free(big);
    }
}

#[test]
fn custom_sink() {
    struct Total(u64);
    impl StatsSink for Total {
        fn add(&mut self, name: &'static str, value: u64) {
            if name.ends_with("_bytes") {
                self.0 += value;
            }
        }
    }
    let heap = panicking(config());
    let mut total = Total(0);
    heap.get_allocator_stats(&mut total);
    assert!(total.0 > 0);
}

#[test]
fn drop_releases_outstanding_memory() {
    let heap = panicking(config());
    for i in 0..100 {
        heap.malloc(i * 97 + 1, 16);
    }
    heap.malloc(1 << 20, 16);
    drop(heap);
}

#[test]
fn cache_outlives_allocator() {
    let heap = panicking(config());
    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let h = heap.clone();
    let t = thread::spawn(move || {
        let p = h.malloc(64, 16);
        unsafe { h.free(p) };
        drop(h);
        ready_tx.send(()).unwrap();
        // The thread's cache, full of blocks, is dropped only after the allocator is gone.
        done_rx.recv().unwrap();
    });
    ready_rx.recv().unwrap();
    drop(heap);
    done_tx.send(()).unwrap();
    t.join().unwrap();
}
