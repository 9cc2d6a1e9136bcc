// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The allocator facade.
//!
//! A `BinnedAllocator` is a cheap handle to shared allocator state; clone it to use the same
//! allocator from several threads. Requests are routed by size and alignment:
//!
//! - Anything a size class can hold at the requested alignment is served from the small pools.
//!   The calling thread's cache is tried first, then the global recycler, and only then the
//!   slabs themselves under the allocator mutex.
//! - Everything else is mapped directly from the virtual memory backend and recorded in the
//!   large allocation index.
//!
//! Frees are routed by address. The small pools occupy fixed address ranges, so a block's size
//! class and slab are known without any lookup table; anything outside those ranges must be a
//! large allocation, and anything that is neither is fatal.
//!
//! There is no error return anywhere in this interface. Out-of-memory, corruption, and misuse
//! all end in the `FatalHandler` given at construction.

use std::cmp;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::bundle::{Bundle, FreeBlockList};
use crate::config::{AllocatorConfig, ConfigError};
use crate::fatal::{AbortHandler, Fatal, FatalError, FatalHandler};
use crate::large::LargeAllocationHashIndex;
use crate::pool::{Lookup, PoolAddressMap, SmallPoolTable};
use crate::recycler::GlobalRecycler;
use crate::size_class::SizeClassTable;
use crate::stats::{self, AllocatorStats, PoolStats, StatsSink};
use crate::thread_cache::{self, ThreadCache};
use crate::vm::{next_multiple, MmapVirtualMemory, VirtualMemory, VmError};

static NEXT_ALLOCATOR_ID: AtomicUsize = AtomicUsize::new(1);

// Everything guarded by the allocator mutex.
struct AllocState {
    pools: Vec<SmallPoolTable>,
    large: LargeAllocationHashIndex,
    committed_bytes: usize,
    peak_committed_bytes: usize,
}

impl AllocState {
    fn alloc_block(
        &mut self,
        pool: usize,
        vm: &dyn VirtualMemory,
        fatal: &Fatal,
    ) -> Option<NonNull<u8>> {
        let p = &mut self.pools[pool];
        let before = p.committed_slabs();
        let block = p.alloc(vm, fatal)?;
        if p.committed_slabs() != before {
            self.committed_bytes += p.slab_bytes();
            self.peak_committed_bytes = cmp::max(self.peak_committed_bytes, self.committed_bytes);
        }
        Some(block)
    }

    fn free_block(
        &mut self,
        pool: usize,
        slab: u32,
        block: NonNull<u8>,
        vm: &dyn VirtualMemory,
        fatal: &Fatal,
    ) {
        let p = &mut self.pools[pool];
        let before = p.committed_slabs();
        p.free(slab, block, vm, fatal);
        if p.committed_slabs() != before {
            self.committed_bytes -= p.slab_bytes();
        }
    }
}

pub(crate) struct Inner {
    id: usize,
    config: AllocatorConfig,
    classes: SizeClassTable,
    vm: Box<dyn VirtualMemory>,
    fatal: Fatal,
    map: PoolAddressMap,
    state: Mutex<AllocState>,
    recycler: GlobalRecycler,
    registry: Mutex<Vec<Weak<ThreadCache>>>,
    // Small bytes allocated minus freed by threads without a live cache.
    consolidated: AtomicI64,
}

impl Inner {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub(crate) fn classes(&self) -> &SizeClassTable {
        &self.classes
    }

    pub(crate) fn recycler(&self) -> &GlobalRecycler {
        &self.recycler
    }

    #[inline]
    pub(crate) fn block_size(&self, pool: usize) -> usize {
        self.map.block_size(pool)
    }

    pub(crate) fn consolidate(&self, bytes: i64) {
        self.consolidated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn register(&self, cache: &Arc<ThreadCache>) {
        let mut registry = self.registry.lock();
        registry.retain(|c| c.strong_count() > 0);
        registry.push(Arc::downgrade(cache));
        debug!(
            "allocator {}: thread cache created, {} live",
            self.id,
            registry.len()
        );
    }

    fn live_caches(&self) -> Vec<Arc<ThreadCache>> {
        self.registry
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Take a block from the slabs of `pool`. If `prefill` is given, also move up to
    /// `alloc_extra` more blocks into it while the mutex is held.
    pub(crate) fn alloc_from_slabs(
        &self,
        pool: usize,
        prefill: Option<&mut FreeBlockList>,
    ) -> NonNull<u8> {
        let vm = &*self.vm;
        let mut state = self.state.lock();
        let block = match state.alloc_block(pool, vm, &self.fatal) {
            Some(block) => block,
            None => self
                .fatal
                .out_of_memory(self.block_size(pool), self.config.min_alignment()),
        };
        if let Some(list) = prefill {
            for _ in 0..self.config.alloc_extra {
                if !list.has_room() {
                    break;
                }
                match state.alloc_block(pool, vm, &self.fatal) {
                    Some(extra) => {
                        let pushed = unsafe { list.push(extra) };
                        alloc_debug_assert!(pushed);
                    }
                    None => break,
                }
            }
        }
        block
    }

    /// Return every block of `bundle` to its slab.
    pub(crate) fn flush_bundle(&self, pool: usize, bundle: Bundle) {
        if bundle.is_empty() {
            return;
        }
        let vm = &*self.vm;
        let mut state = self.state.lock();
        for block in bundle {
            match self.map.lookup(block.as_ptr() as usize) {
                Lookup::Block { pool: p, slab } if p == pool => {
                    state.free_block(pool, slab, block, vm, &self.fatal)
                }
                _ => self.fatal.unrecognized(block.as_ptr()),
            }
        }
    }

    fn alloc_large(&self, size: usize, align: usize) -> NonNull<u8> {
        trace_event!(large_alloc);
        let block = match self.vm.allocate_large(size, align) {
            Ok(block) => block,
            Err(VmError::AlignmentTooLarge { .. }) => {
                self.fatal.raise(FatalError::AlignmentTooLarge { size, align })
            }
            Err(VmError::Exhausted) => self.fatal.out_of_memory(size, align),
        };
        self.state.lock().large.insert(
            block.ptr.as_ptr() as usize,
            size,
            block.commit_size,
            block.vm_units,
            &self.fatal,
        );
        block.ptr
    }

    fn free_large(&self, block: NonNull<u8>) {
        trace_event!(large_free);
        let addr = block.as_ptr() as usize;
        let info = match self.state.lock().large.remove(addr, &self.fatal) {
            Some(info) => info,
            None => self.fatal.unrecognized(block.as_ptr()),
        };
        unsafe { self.vm.free_large(block, info.vm_units) };
    }

    /// Resize a large block without moving it, if `new_size` is still large and fits in the
    /// block's original mapping. Otherwise returns the bytes readable at `block`.
    fn resize_large(&self, block: NonNull<u8>, new_size: usize, align: usize) -> Result<(), usize> {
        let addr = block.as_ptr() as usize;
        let mut state = self.state.lock();
        let info = match state.large.find(addr, &self.fatal) {
            Some(info) => info,
            None => self.fatal.unrecognized(block.as_ptr()),
        };
        let reserved = info.vm_units * self.vm.allocation_granularity();
        if new_size <= self.classes.max_size() || new_size > reserved || addr % align != 0 {
            return Err(info.committed_bytes);
        }
        let old_commit = info.committed_bytes;
        let new_commit = match next_multiple(new_size, self.vm.page_size()) {
            Some(commit) => commit,
            None => return Err(old_commit),
        };
        unsafe {
            if new_commit > old_commit {
                let tail = NonNull::new_unchecked((addr + old_commit) as *mut u8);
                if self.vm.commit(tail, new_commit - old_commit).is_err() {
                    return Err(old_commit);
                }
            } else if new_commit < old_commit {
                let tail = NonNull::new_unchecked((addr + new_commit) as *mut u8);
                self.vm.decommit(tail, old_commit - new_commit);
            }
        }
        state.large.resize(addr, new_size, new_commit);
        trace!(
            "resized large block at {:#x} in place: {} -> {} committed bytes",
            addr,
            old_commit,
            new_commit
        );
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let vm = &*self.vm;
        let state = self.state.get_mut();
        let large = state.large.drain();
        if !large.is_empty() {
            debug!("allocator {}: releasing {} live large blocks", self.id, large.len());
        }
        for (ptr, units) in large {
            unsafe { vm.free_large(ptr, units) };
        }
        let leaked: u64 = state.pools.iter_mut().map(|p| p.decommit_all(vm)).sum();
        if leaked > 0 {
            debug!("allocator {}: {} small blocks still live at teardown", self.id, leaked);
        }
        unsafe { self.map.release(vm) };
    }
}

/// A segregated-size allocator with per-thread caching.
#[derive(Clone)]
pub struct BinnedAllocator {
    inner: Arc<Inner>,
}

impl Default for BinnedAllocator {
    fn default() -> BinnedAllocator {
        BinnedAllocator::new()
    }
}

impl BinnedAllocator {
    /// An allocator with the default configuration that aborts on fatal errors.
    pub fn new() -> BinnedAllocator {
        BinnedAllocator::with_config(AllocatorConfig::default())
    }

    pub fn with_config(config: AllocatorConfig) -> BinnedAllocator {
        BinnedAllocator::with_handler(config, Arc::new(AbortHandler))
    }

    /// An allocator that reports fatal errors to `handler`.
    pub fn with_handler(config: AllocatorConfig, handler: Arc<dyn FatalHandler>) -> BinnedAllocator {
        if let Err(e) = config.validate() {
            Fatal::new(handler.clone()).raise(FatalError::InvalidConfig(e));
        }
        let vm = MmapVirtualMemory::with_granularity(config.commit_granularity);
        BinnedAllocator::with_vm(config, Box::new(vm), handler)
    }

    /// An allocator on top of a custom virtual memory backend.
    pub fn with_vm(
        config: AllocatorConfig,
        vm: Box<dyn VirtualMemory>,
        handler: Arc<dyn FatalHandler>,
    ) -> BinnedAllocator {
        let fatal = Fatal::new(handler);
        if let Err(e) = config.validate() {
            fatal.raise(FatalError::InvalidConfig(e));
        }
        if config.page_size % vm.page_size() != 0 {
            fatal.raise(FatalError::InvalidConfig(ConfigError::BackendPageSize {
                page_size: config.page_size,
                backend: vm.page_size(),
            }));
        }
        let classes = SizeClassTable::new(&config);
        let map = match PoolAddressMap::new(&classes, &config, &*vm) {
            Ok(map) => map,
            Err(_) => fatal.out_of_memory(
                config.max_memory_per_block_size.saturating_mul(classes.len()),
                config.page_size,
            ),
        };
        let state = AllocState {
            pools: map.pools(),
            large: LargeAllocationHashIndex::new(
                vm.allocation_granularity(),
                config.page_size,
                config.large_hash_buckets,
            ),
            committed_bytes: 0,
            peak_committed_bytes: 0,
        };
        let id = NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "allocator {}: {} size classes up to {} bytes",
            id,
            classes.len(),
            classes.max_size()
        );
        BinnedAllocator {
            inner: Arc::new(Inner {
                id,
                recycler: GlobalRecycler::new(classes.len(), config.max_global_bundles),
                classes,
                vm,
                fatal,
                map,
                state: Mutex::new(state),
                registry: Mutex::new(Vec::new()),
                consolidated: AtomicI64::new(0),
                config,
            }),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.inner.config
    }

    /// Allocate `size` bytes aligned to `align`, a power of two. Never returns null; a zero
    /// `size` yields a minimum-size block.
    pub fn malloc(&self, size: usize, align: usize) -> *mut u8 {
        let align = cmp::max(align, 1);
        alloc_assert!(align.is_power_of_two(), "alignment {} is not a power of two", align);
        let size = cmp::max(size, 1);
        match self.inner.classes.index_for(size, align) {
            Some(pool) => self.alloc_small(pool).as_ptr(),
            None => self.inner.alloc_large(size, align).as_ptr(),
        }
    }

    /// Like `malloc`, but the returned memory is zeroed.
    pub fn malloc_zeroed(&self, size: usize, align: usize) -> *mut u8 {
        let ptr = self.malloc(size, align);
        if let Lookup::Block { pool, .. } = self.inner.map.lookup(ptr as usize) {
            // Large blocks are fresh mappings and already zero.
            unsafe { ptr::write_bytes(ptr, 0, self.inner.block_size(pool)) };
        }
        ptr
    }

    fn alloc_small(&self, pool: usize) -> NonNull<u8> {
        let inner = &self.inner;
        thread_cache::with_cache(inner, inner.config.per_thread_caches, |cache| match cache {
            Some(cache) => cache.alloc(inner, pool),
            None => {
                let block = inner.alloc_from_slabs(pool, None);
                inner.consolidate(inner.block_size(pool) as i64);
                block
            }
        })
    }

    /// Free a block. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator, and must not be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let block = match NonNull::new(ptr) {
            Some(block) => block,
            None => return,
        };
        let inner = &self.inner;
        match inner.map.lookup(ptr as usize) {
            Lookup::Block { pool, slab } => self.free_small(pool, slab, block),
            Lookup::Invalid => inner.fatal.unrecognized(ptr),
            Lookup::NotSmall => inner.free_large(block),
        }
    }

    fn free_small(&self, pool: usize, slab: u32, block: NonNull<u8>) {
        let inner = &self.inner;
        thread_cache::with_cache(inner, inner.config.per_thread_caches, |cache| match cache {
            Some(cache) => cache.free(inner, pool, block),
            None => {
                inner
                    .state
                    .lock()
                    .free_block(pool, slab, block, &*inner.vm, &inner.fatal);
                inner.consolidate(-(inner.block_size(pool) as i64));
            }
        })
    }

    /// Resize an allocation, preserving its contents up to the smaller of the two sizes.
    ///
    /// A null `ptr` allocates; a zero `new_size` frees and returns null. Blocks stay put when
    /// the new size maps to the same size class, or when a large block can grow or shrink
    /// within its original mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator. Unless the same pointer is
    /// returned, it must not be used afterwards.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize, align: usize) -> *mut u8 {
        let block = match NonNull::new(ptr) {
            Some(block) => block,
            None => return self.malloc(new_size, align),
        };
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        let align = cmp::max(align, 1);
        let inner = &self.inner;
        let old_size = match inner.map.lookup(ptr as usize) {
            Lookup::Block { pool, .. } => {
                if inner.classes.index_for(new_size, align) == Some(pool) {
                    return ptr;
                }
                inner.block_size(pool)
            }
            Lookup::Invalid => inner.fatal.unrecognized(ptr),
            Lookup::NotSmall => match inner.resize_large(block, new_size, align) {
                Ok(()) => return ptr,
                Err(readable) => readable,
            },
        };
        let new = self.malloc(new_size, align);
        ptr::copy_nonoverlapping(ptr, new, cmp::min(old_size, new_size));
        self.free(ptr);
        new
    }

    /// The usable size of an allocation: its block size if small, its committed size if
    /// large. `None` for null.
    pub fn get_allocation_size(&self, ptr: *const u8) -> Option<usize> {
        if ptr.is_null() {
            return None;
        }
        let inner = &self.inner;
        match inner.map.lookup(ptr as usize) {
            Lookup::Block { pool, .. } => Some(inner.block_size(pool)),
            Lookup::Invalid => inner.fatal.unrecognized(ptr),
            Lookup::NotSmall => match inner.state.lock().large.find(ptr as usize, &inner.fatal) {
                Some(info) => Some(info.committed_bytes),
                None => inner.fatal.unrecognized(ptr),
            },
        }
    }

    /// Return cached memory to the slabs, decommitting every slab that empties.
    ///
    /// The global recycler is always drained. With `trim_thread_caches`, the caches of every
    /// thread are flushed too.
    pub fn trim(&self, trim_thread_caches: bool) {
        let inner = &self.inner;
        let start = Instant::now();
        let mut caches = 0;
        if trim_thread_caches {
            let live = inner.live_caches();
            for cache in &live {
                cache.flush(inner);
            }
            caches = live.len();
        }
        let mut bundles = 0;
        for pool in 0..inner.classes.len() {
            for bundle in inner.recycler.drain(pool) {
                bundles += 1;
                inner.flush_bundle(pool, bundle);
            }
        }
        let elapsed = start.elapsed();
        debug!(
            "allocator {}: trim flushed {} thread caches and {} bundles in {:?}",
            inner.id,
            caches,
            bundles,
            elapsed
        );
        if elapsed > inner.config.trim_warn_threshold {
            warn!(
                "allocator {}: trim took {:?}, over the {:?} threshold",
                inner.id,
                elapsed,
                inner.config.trim_warn_threshold
            );
        }
    }

    /// Create the calling thread's cache now, re-enabling caching if it was disabled.
    pub fn setup_tls_caches_on_current_thread(&self) {
        thread_cache::setup(&self.inner);
    }

    /// Flush and drop the calling thread's cache, and allocate without one from now on.
    pub fn clear_and_disable_tls_caches_on_current_thread(&self) {
        thread_cache::clear_and_disable(&self.inner);
    }

    /// Return the calling thread's cached blocks to their slabs, keeping the cache.
    pub fn flush_current_thread_cache(&self) {
        let inner = &self.inner;
        thread_cache::with_cache(inner, false, |cache| {
            if let Some(cache) = cache {
                cache.flush(inner);
            }
        });
    }

    pub fn stats(&self) -> AllocatorStats {
        let inner = &self.inner;
        let caches = inner.live_caches();
        let (recycled_bundles, recycled_blocks) = inner.recycler.occupancy();
        let mut s = AllocatorStats {
            small_allocated_bytes: inner.consolidated.load(Ordering::Relaxed)
                + caches.iter().map(|c| c.allocated_bytes()).sum::<i64>(),
            thread_caches: caches.len(),
            thread_cached_blocks: caches.iter().map(|c| c.cached_blocks()).sum(),
            recycled_bundles,
            recycled_blocks,
            ..AllocatorStats::default()
        };
        let cache_bytes = caches.len()
            * (mem::size_of::<ThreadCache>()
                + inner.classes.len() * mem::size_of::<FreeBlockList>());
        let state = inner.state.lock();
        s.small_committed_bytes = state.committed_bytes;
        s.small_committed_bytes_peak = state.peak_committed_bytes;
        s.committed_slabs = state.pools.iter().map(|p| u64::from(p.committed_slabs())).sum();
        s.high_water_slabs = state.pools.iter().map(|p| u64::from(p.high_water_slabs())).sum();
        s.large_allocations = state.large.live();
        s.large_requested_bytes = state.large.requested_bytes();
        s.large_committed_bytes = state.large.committed_bytes();
        s.bookkeeping_bytes = state
            .pools
            .iter()
            .map(SmallPoolTable::bookkeeping_bytes)
            .sum::<usize>()
            + state.large.bookkeeping_bytes()
            + cache_bytes;
        s
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let inner = &self.inner;
        let state = inner.state.lock();
        state
            .pools
            .iter()
            .zip(inner.classes.iter())
            .map(|(p, c)| PoolStats {
                block_size: p.block_size(),
                blocks_per_slab: c.blocks_per_slab,
                committed_slabs: p.committed_slabs(),
                exhausted_slabs: p.exhausted_slabs(),
                high_water_slabs: p.high_water_slabs(),
                taken_blocks: p.taken_blocks(),
            })
            .collect()
    }

    /// Report `stats()` to `sink`.
    pub fn get_allocator_stats(&self, sink: &mut dyn StatsSink) {
        self.stats().report(sink);
    }

    /// Write a human-readable summary and per-size-class table. For diagnostics only.
    pub fn dump_allocator_stats(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        stats::dump(w, &self.stats(), &self.pool_stats())
    }
}

impl fmt::Debug for BinnedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BinnedAllocator")
            .field("id", &self.inner.id)
            .field("size_classes", &self.inner.classes.len())
            .field("max_small_size", &self.inner.classes.max_size())
            .finish()
    }
}
