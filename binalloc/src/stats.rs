// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocator statistics, and lightweight per-thread event tracing.

use std::cell::RefCell;
use std::fmt;

/// Receives named counters from `BinnedAllocator::get_allocator_stats`.
pub trait StatsSink {
    fn add(&mut self, name: &'static str, value: u64);
}

impl StatsSink for Vec<(&'static str, u64)> {
    fn add(&mut self, name: &'static str, value: u64) {
        self.push((name, value));
    }
}

/// A snapshot of allocator-wide counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes of small blocks currently handed out, summed over exited threads and every live
    /// thread cache. Individual threads may be negative when they free blocks other threads
    /// allocated; the sum is not.
    pub small_allocated_bytes: i64,
    pub small_committed_bytes: usize,
    pub small_committed_bytes_peak: usize,
    pub committed_slabs: u64,
    /// Sum over size classes of the most slabs each ever had committed at once.
    pub high_water_slabs: u64,
    pub large_allocations: usize,
    pub large_requested_bytes: usize,
    pub large_committed_bytes: usize,
    pub bookkeeping_bytes: usize,
    pub recycled_bundles: usize,
    pub recycled_blocks: u64,
    pub thread_caches: usize,
    pub thread_cached_blocks: u64,
}

impl AllocatorStats {
    pub fn report(&self, sink: &mut dyn StatsSink) {
        sink.add("small_allocated_bytes", self.small_allocated_bytes.max(0) as u64);
        sink.add("small_committed_bytes", self.small_committed_bytes as u64);
        sink.add("small_committed_bytes_peak", self.small_committed_bytes_peak as u64);
        sink.add("committed_slabs", self.committed_slabs);
        sink.add("high_water_slabs", self.high_water_slabs);
        sink.add("large_allocations", self.large_allocations as u64);
        sink.add("large_requested_bytes", self.large_requested_bytes as u64);
        sink.add("large_committed_bytes", self.large_committed_bytes as u64);
        sink.add("bookkeeping_bytes", self.bookkeeping_bytes as u64);
        sink.add("recycled_bundles", self.recycled_bundles as u64);
        sink.add("recycled_blocks", self.recycled_blocks);
        sink.add("thread_caches", self.thread_caches as u64);
        sink.add("thread_cached_blocks", self.thread_cached_blocks);
    }
}

/// Counters for one size class.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub blocks_per_slab: u32,
    pub committed_slabs: u32,
    pub exhausted_slabs: u32,
    pub high_water_slabs: u32,
    /// Blocks out of their slabs: handed to users or sitting in a cache.
    pub taken_blocks: u64,
}

pub(crate) fn dump(
    w: &mut dyn fmt::Write,
    stats: &AllocatorStats,
    pools: &[PoolStats],
) -> fmt::Result {
    writeln!(
        w,
        "small: {} bytes allocated, {} bytes committed (peak {}) in {} slabs",
        stats.small_allocated_bytes,
        stats.small_committed_bytes,
        stats.small_committed_bytes_peak,
        stats.committed_slabs
    )?;
    writeln!(
        w,
        "large: {} allocations, {} bytes requested, {} bytes committed",
        stats.large_allocations, stats.large_requested_bytes, stats.large_committed_bytes
    )?;
    writeln!(
        w,
        "caches: {} threads holding {} blocks, {} bundles ({} blocks) recycled",
        stats.thread_caches,
        stats.thread_cached_blocks,
        stats.recycled_bundles,
        stats.recycled_blocks
    )?;
    writeln!(w, "bookkeeping: {} bytes", stats.bookkeeping_bytes)?;
    writeln!(
        w,
        "{:>8} {:>6} {:>9} {:>9} {:>10} {:>10}",
        "block", "/slab", "committed", "exhausted", "high-water", "taken"
    )?;
    for p in pools.iter().filter(|p| p.high_water_slabs > 0) {
        writeln!(
            w,
            "{:>8} {:>6} {:>9} {:>9} {:>10} {:>10}",
            p.block_size,
            p.blocks_per_slab,
            p.committed_slabs,
            p.exhausted_slabs,
            p.high_water_slabs,
            p.taken_blocks
        )?;
    }
    Ok(())
}

/// Per-thread counts of which path allocations and frees took. Only maintained with the
/// `print_stats` feature.
#[derive(Default, Debug, Clone, Copy)]
pub struct EventCounts {
    pub cache_alloc: i64,
    pub recycler_alloc: i64,
    pub slab_alloc: i64,
    pub large_alloc: i64,

    pub cache_free: i64,
    pub recycler_free: i64,
    pub slab_free: i64,
    pub large_free: i64,
}

#[allow(dead_code)]
pub struct EventHandle(pub RefCell<EventCounts>);

thread_local! {
    pub static LOCAL_EVENTS: EventHandle = EventHandle(RefCell::new(EventCounts::default()));
}

macro_rules! trace_event {
    ($fld:tt) => {{
        #[cfg(feature = "print_stats")]
        {
            let _ = $crate::stats::LOCAL_EVENTS.try_with(|h| {
                let mut counts = h.0.borrow_mut();
                counts.$fld += 1;
                let events = counts.cache_alloc
                    + counts.recycler_alloc
                    + counts.slab_alloc
                    + counts.large_alloc
                    + counts.cache_free
                    + counts.recycler_free
                    + counts.slab_free
                    + counts.large_free;
                if events % (1 << 20) == 0 {
                    trace!("thread {:?} - {:?}", ::std::thread::current().id(), *counts);
                }
            });
        }
    }};
}
