// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Small pools: one table of slabs per size class.
//!
//! Every size class owns a fixed, contiguous range of reserved address space, carved into
//! equal-sized slabs. A slab is identified by its index within the range, so the slab (and the
//! pool) owning any block is computed from the block's address alone. The address ranges never
//! move, and `PoolAddressMap` does this reverse mapping without taking any lock.
//!
//! Per slab index, a `SmallPoolTable` tracks
//!
//! - a bit in `slabs`, set while the slab is committed. The same fact is mirrored in a
//!   `CommittedSlabs` set shared with the `PoolAddressMap`, so lookups can reject addresses in
//!   decommitted slabs without the lock;
//! - a bit in `exhausted`, set while the slab has no free blocks. Unmapped slabs also have their
//!   bit set, so the lowest clear bit is always a committed slab we can allocate from;
//! - a `PoolInfoSmall` record in a dense arena indexed by slab index. Records are never freed;
//!   their canary cycles between `POOL_INFO_ASSIGNED` and `POOL_INFO_UNASSIGNED` as the slab is
//!   committed and decommitted.
//!
//! # Free lists
//!
//! Free blocks inside a slab form an intrusive list of runs. The header of a run lives in the
//! run's first block and records how many contiguous free blocks follow it. A fresh slab is a
//! single run covering the whole slab. Allocation takes blocks off the end of the head run, so
//! formatting a slab costs one header write. Freed blocks are pushed as runs of one.

use std::cmp;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bit_tree::BitTree;
use crate::config::AllocatorConfig;
use crate::fatal::Fatal;
use crate::size_class::{SizeClass, SizeClassTable};
use crate::vm::{next_multiple, VirtualMemory, VmBlock, VmError};

pub(crate) const POOL_INFO_ASSIGNED: u16 = 0x17ea;
pub(crate) const POOL_INFO_UNASSIGNED: u16 = 0x3941;
const FREE_BLOCK_CANARY: u16 = 0xfb1c;

#[repr(C)]
struct FreeBlock {
    canary: u16,
    pool_index: u16,
    num_free_blocks: u32,
    next_free: *mut FreeBlock,
}

pub(crate) struct PoolInfoSmall {
    canary: u16,
    taken: u32,
    first_free: *mut FreeBlock,
}

impl PoolInfoSmall {
    fn unassigned() -> PoolInfoSmall {
        PoolInfoSmall {
            canary: POOL_INFO_UNASSIGNED,
            taken: 0,
            first_free: ptr::null_mut(),
        }
    }

    #[inline]
    fn check(&self, expected: u16, fatal: &Fatal) {
        if self.canary != expected {
            fatal.corruption("PoolInfoSmall", u32::from(expected), u32::from(self.canary));
        }
    }
}

/// Where a pool lives and how it is cut up. Fixed at construction.
#[derive(Copy, Clone, Debug)]
pub(crate) struct PoolGeometry {
    base: usize,
    slab_bytes: usize,
    slab_capacity: u32,
    block_size: usize,
    blocks_per_slab: u32,
}

impl PoolGeometry {
    fn new(class: &SizeClass, base: usize, span: usize, page_size: usize) -> PoolGeometry {
        let slab_bytes = class.slab_bytes(page_size);
        PoolGeometry {
            base,
            slab_bytes,
            slab_capacity: (span / slab_bytes) as u32,
            block_size: class.block_size as usize,
            blocks_per_slab: class.blocks_per_slab,
        }
    }

    #[inline]
    fn slab_addr(&self, slab: u32) -> usize {
        self.base + slab as usize * self.slab_bytes
    }

    fn lookup(&self, pool: usize, addr: usize) -> Lookup {
        let offset = addr - self.base;
        let slab = offset / self.slab_bytes;
        let within = offset % self.slab_bytes;
        if slab >= self.slab_capacity as usize
            || within % self.block_size != 0
            || within / self.block_size >= self.blocks_per_slab as usize
        {
            return Lookup::Invalid;
        }
        Lookup::Block {
            pool,
            slab: slab as u32,
        }
    }
}

/// The result of mapping an address onto the small pools.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Outside every pool's range; possibly a large allocation.
    NotSmall,
    /// The start of block in slab `slab` of pool `pool`.
    Block { pool: usize, slab: u32 },
    /// Inside a pool's range but not the start of a block in a committed slab.
    Invalid,
}

/// One bit per slab, set while the slab is committed. Written under the allocator lock, read
/// without it.
pub(crate) struct CommittedSlabs {
    words: Box<[AtomicU64]>,
}

impl CommittedSlabs {
    fn new(capacity: u32) -> CommittedSlabs {
        let words = (capacity as usize + 63) / 64;
        CommittedSlabs {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn contains(&self, slab: u32) -> bool {
        let word = self.words[slab as usize / 64].load(Ordering::Acquire);
        word & (1 << (slab % 64)) != 0
    }

    fn insert(&self, slab: u32) {
        self.words[slab as usize / 64].fetch_or(1 << (slab % 64), Ordering::Release);
    }

    fn remove(&self, slab: u32) {
        self.words[slab as usize / 64].fetch_and(!(1 << (slab % 64)), Ordering::Release);
    }

    fn memory_bytes(&self) -> usize {
        self.words.len() * mem::size_of::<AtomicU64>()
    }
}

fn committed_sets(geometry: &[PoolGeometry]) -> Vec<Arc<CommittedSlabs>> {
    geometry
        .iter()
        .map(|g| Arc::new(CommittedSlabs::new(g.slab_capacity)))
        .collect()
}

enum Layout {
    // One reservation; pool `i` starts at `start + i * span`.
    Shared { start: usize, end: usize, span: usize },
    // One reservation per pool, sorted by start address.
    Separate { by_start: Vec<(usize, usize)>, span: usize },
}

/// The immutable address layout of every small pool.
pub(crate) struct PoolAddressMap {
    geometry: Vec<PoolGeometry>,
    committed: Vec<Arc<CommittedSlabs>>,
    layout: Layout,
    reservations: Vec<VmBlock>,
}

impl PoolAddressMap {
    pub(crate) fn new(
        table: &SizeClassTable,
        config: &AllocatorConfig,
        vm: &dyn VirtualMemory,
    ) -> Result<PoolAddressMap, VmError> {
        let page_size = config.page_size;
        let largest_slab = table
            .iter()
            .map(|c| c.slab_bytes(page_size))
            .max()
            .unwrap_or(page_size);
        let span = next_multiple(
            cmp::max(config.max_memory_per_block_size, largest_slab),
            vm.allocation_granularity(),
        )
        .ok_or(VmError::Exhausted)?;

        if config.separate_vm_per_pool {
            let mut reservations = Vec::with_capacity(table.len());
            let mut geometry = Vec::with_capacity(table.len());
            for class in table.iter() {
                let block = match vm.reserve(span) {
                    Ok(block) => block,
                    Err(e) => {
                        for b in reservations.drain(..) {
                            unsafe { vm.release(b) };
                        }
                        return Err(e);
                    }
                };
                geometry.push(PoolGeometry::new(class, block.start(), span, page_size));
                reservations.push(block);
            }
            let mut by_start: Vec<(usize, usize)> =
                geometry.iter().enumerate().map(|(i, g)| (g.base, i)).collect();
            by_start.sort();
            Ok(PoolAddressMap {
                committed: committed_sets(&geometry),
                geometry,
                layout: Layout::Separate { by_start, span },
                reservations,
            })
        } else {
            let total = span.checked_mul(table.len()).ok_or(VmError::Exhausted)?;
            let block = vm.reserve(total)?;
            let start = block.start();
            let geometry: Vec<PoolGeometry> = table
                .iter()
                .enumerate()
                .map(|(i, class)| PoolGeometry::new(class, start + i * span, span, page_size))
                .collect();
            Ok(PoolAddressMap {
                committed: committed_sets(&geometry),
                geometry,
                layout: Layout::Shared {
                    start,
                    end: start + total,
                    span,
                },
                reservations: vec![block],
            })
        }
    }

    pub(crate) fn lookup(&self, addr: usize) -> Lookup {
        let pool = match self.layout {
            Layout::Shared { start, end, span } => {
                if addr < start || addr >= end {
                    return Lookup::NotSmall;
                }
                (addr - start) / span
            }
            Layout::Separate { ref by_start, span } => {
                let i = match by_start.binary_search_by(|&(base, _)| base.cmp(&addr)) {
                    Ok(i) => i,
                    Err(0) => return Lookup::NotSmall,
                    Err(i) => i - 1,
                };
                let (base, pool) = by_start[i];
                if addr - base >= span {
                    return Lookup::NotSmall;
                }
                pool
            }
        };
        match self.geometry[pool].lookup(pool, addr) {
            Lookup::Block { slab, .. } if !self.committed[pool].contains(slab) => Lookup::Invalid,
            found => found,
        }
    }

    #[inline]
    pub(crate) fn block_size(&self, pool: usize) -> usize {
        self.geometry[pool].block_size
    }

    /// Build the mutable per-pool state on top of this layout.
    pub(crate) fn pools(&self) -> Vec<SmallPoolTable> {
        self.geometry
            .iter()
            .enumerate()
            .map(|(i, g)| SmallPoolTable::new(i, *g, self.committed[i].clone()))
            .collect()
    }

    /// Give every reservation back. Must be called at most once, after no block is in use.
    pub(crate) unsafe fn release(&mut self, vm: &dyn VirtualMemory) {
        for block in self.reservations.drain(..) {
            vm.release(block);
        }
    }
}

/// The slabs of one size class.
pub(crate) struct SmallPoolTable {
    index: u16,
    geometry: PoolGeometry,
    slabs: BitTree,
    live: Arc<CommittedSlabs>,
    exhausted: BitTree,
    infos: Vec<PoolInfoSmall>,
    committed: u32,
    high_water: u32,
    taken: u64,
}

// The raw pointers in PoolInfoSmall point into slabs this table owns.
unsafe impl Send for SmallPoolTable {}

impl SmallPoolTable {
    fn new(index: usize, geometry: PoolGeometry, live: Arc<CommittedSlabs>) -> SmallPoolTable {
        SmallPoolTable {
            index: index as u16,
            geometry,
            slabs: BitTree::new(geometry.slab_capacity, false),
            live,
            exhausted: BitTree::new(geometry.slab_capacity, true),
            infos: Vec::new(),
            committed: 0,
            high_water: 0,
            taken: 0,
        }
    }

    #[inline]
    pub(crate) fn block_size(&self) -> usize {
        self.geometry.block_size
    }

    #[inline]
    pub(crate) fn slab_bytes(&self) -> usize {
        self.geometry.slab_bytes
    }

    /// Take one block, committing a new slab if every committed one is exhausted. `None` means
    /// the pool's address range or the system is out of memory.
    pub(crate) fn alloc(&mut self, vm: &dyn VirtualMemory, fatal: &Fatal) -> Option<NonNull<u8>> {
        let slab = match self.exhausted.next_free_bit() {
            Some(slab) => slab,
            None => self.commit_slab(vm, fatal)?,
        };
        Some(self.pop(slab, fatal))
    }

    fn commit_slab(&mut self, vm: &dyn VirtualMemory, fatal: &Fatal) -> Option<u32> {
        let slab = self.slabs.alloc_bit()?;
        let addr = self.geometry.slab_addr(slab);
        let base = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        if unsafe { vm.commit(base, self.geometry.slab_bytes) }.is_err() {
            self.slabs.free_bit(slab);
            return None;
        }
        if self.infos.len() <= slab as usize {
            self.infos
                .resize_with(slab as usize + 1, PoolInfoSmall::unassigned);
        }
        let info = &mut self.infos[slab as usize];
        info.check(POOL_INFO_UNASSIGNED, fatal);
        let head = addr as *mut FreeBlock;
        unsafe {
            ptr::write(
                head,
                FreeBlock {
                    canary: FREE_BLOCK_CANARY,
                    pool_index: self.index,
                    num_free_blocks: self.geometry.blocks_per_slab,
                    next_free: ptr::null_mut(),
                },
            );
        }
        *info = PoolInfoSmall {
            canary: POOL_INFO_ASSIGNED,
            taken: 0,
            first_free: head,
        };
        self.live.insert(slab);
        self.exhausted.free_bit(slab);
        self.committed += 1;
        self.high_water = cmp::max(self.high_water, self.committed);
        trace!(
            "pool {}: committed slab {} at {:#x}",
            self.geometry.block_size,
            slab,
            addr
        );
        Some(slab)
    }

    fn pop(&mut self, slab: u32, fatal: &Fatal) -> NonNull<u8> {
        let block_size = self.geometry.block_size;
        let index = self.index;
        let info = &mut self.infos[slab as usize];
        info.check(POOL_INFO_ASSIGNED, fatal);
        let head = info.first_free;
        alloc_debug_assert!(!head.is_null());
        let block = unsafe {
            let header = &mut *head;
            if header.canary != FREE_BLOCK_CANARY {
                fatal.corruption(
                    "FreeBlock",
                    u32::from(FREE_BLOCK_CANARY),
                    u32::from(header.canary),
                );
            }
            if header.pool_index != index {
                fatal.corruption(
                    "FreeBlock owner",
                    u32::from(index),
                    u32::from(header.pool_index),
                );
            }
            if header.num_free_blocks > 1 {
                header.num_free_blocks -= 1;
                (head as *mut u8).add(header.num_free_blocks as usize * block_size)
            } else {
                info.first_free = header.next_free;
                head as *mut u8
            }
        };
        info.taken += 1;
        let exhausted = info.first_free.is_null();
        self.taken += 1;
        if exhausted {
            self.exhausted.alloc_bit_at(slab);
        }
        unsafe { NonNull::new_unchecked(block) }
    }

    /// Return a block to slab `slab`, decommitting the slab if it empties.
    pub(crate) fn free(
        &mut self,
        slab: u32,
        block: NonNull<u8>,
        vm: &dyn VirtualMemory,
        fatal: &Fatal,
    ) {
        let index = self.index;
        let info = match self.infos.get_mut(slab as usize) {
            Some(info) if info.canary != POOL_INFO_UNASSIGNED => info,
            _ => fatal.unrecognized(block.as_ptr()),
        };
        info.check(POOL_INFO_ASSIGNED, fatal);
        if info.taken == 0 {
            fatal.unrecognized(block.as_ptr());
        }
        let was_exhausted = info.first_free.is_null();
        let header = block.as_ptr() as *mut FreeBlock;
        unsafe {
            ptr::write(
                header,
                FreeBlock {
                    canary: FREE_BLOCK_CANARY,
                    pool_index: index,
                    num_free_blocks: 1,
                    next_free: info.first_free,
                },
            );
        }
        info.first_free = header;
        info.taken -= 1;
        let empty = info.taken == 0;
        self.taken -= 1;
        if empty {
            self.decommit_slab(slab, vm);
        } else if was_exhausted {
            self.exhausted.free_bit(slab);
        }
    }

    fn decommit_slab(&mut self, slab: u32, vm: &dyn VirtualMemory) {
        let info = &mut self.infos[slab as usize];
        info.canary = POOL_INFO_UNASSIGNED;
        info.first_free = ptr::null_mut();
        self.live.remove(slab);
        self.exhausted.alloc_bit_at(slab);
        self.slabs.free_bit(slab);
        let addr = self.geometry.slab_addr(slab);
        unsafe {
            vm.decommit(
                NonNull::new_unchecked(addr as *mut u8),
                self.geometry.slab_bytes,
            );
        }
        self.committed -= 1;
        trace!(
            "pool {}: decommitted slab {} at {:#x}",
            self.geometry.block_size,
            slab,
            addr
        );
    }

    /// Decommit every slab regardless of occupancy. Returns the number of blocks that were
    /// still handed out.
    pub(crate) fn decommit_all(&mut self, vm: &dyn VirtualMemory) -> u64 {
        let leaked = self.taken;
        while let Some(slab) = self.slabs.next_alloc_bit() {
            self.infos[slab as usize].taken = 0;
            self.decommit_slab(slab, vm);
        }
        self.taken = 0;
        leaked
    }

    pub(crate) fn committed_slabs(&self) -> u32 {
        self.committed
    }

    pub(crate) fn high_water_slabs(&self) -> u32 {
        self.high_water
    }

    pub(crate) fn taken_blocks(&self) -> u64 {
        self.taken
    }

    pub(crate) fn exhausted_slabs(&self) -> u32 {
        // Unmapped slabs carry the exhausted bit too.
        let cap = self.geometry.slab_capacity;
        self.exhausted.count_ones(cap) - (cap - self.committed)
    }

    pub(crate) fn bookkeeping_bytes(&self) -> usize {
        self.infos.capacity() * mem::size_of::<PoolInfoSmall>()
            + self.slabs.memory_bytes()
            + self.live.memory_bytes()
            + self.exhausted.memory_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfigBuilder;
    use crate::fatal::PanicHandler;
    use crate::vm::MmapVirtualMemory;
    use std::sync::Arc;

    fn setup(separate: bool) -> (SizeClassTable, PoolAddressMap, MmapVirtualMemory) {
        let config = AllocatorConfigBuilder::default()
            .max_memory_per_block_size(1 << 20)
            .separate_vm_per_pool(separate)
            .build()
            .unwrap();
        let vm = MmapVirtualMemory::default();
        let table = SizeClassTable::new(&config);
        let map = PoolAddressMap::new(&table, &config, &vm).unwrap();
        (table, map, vm)
    }

    fn fatal() -> Fatal {
        Fatal::new(Arc::new(PanicHandler))
    }

    #[test]
    fn slab_lifecycle() {
        let (table, mut map, vm) = setup(false);
        let fatal = fatal();
        let idx = table.index_for_size(64).unwrap();
        let mut pools = map.pools();
        let pool = &mut pools[idx];
        let per_slab = table.get(idx).blocks_per_slab as usize;

        let mut blocks = Vec::new();
        for _ in 0..per_slab {
            blocks.push(pool.alloc(&vm, &fatal).unwrap());
        }
        assert_eq!(pool.committed_slabs(), 1);
        assert_eq!(pool.exhausted_slabs(), 1);
        blocks.push(pool.alloc(&vm, &fatal).unwrap());
        assert_eq!(pool.committed_slabs(), 2);
        assert_eq!(pool.exhausted_slabs(), 1);

        let mut sorted: Vec<usize> = blocks.iter().map(|p| p.as_ptr() as usize).collect();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), blocks.len());
        for (i, p) in blocks.iter().enumerate() {
            assert_eq!(p.as_ptr() as usize % 64, 0);
            unsafe { ptr::write_bytes(p.as_ptr(), i as u8, 64) };
            match map.lookup(p.as_ptr() as usize) {
                Lookup::Block { pool, .. } => assert_eq!(pool, idx),
                other => panic!("unexpected lookup {:?}", other),
            }
        }

        for p in blocks.drain(..) {
            let slab = match map.lookup(p.as_ptr() as usize) {
                Lookup::Block { slab, .. } => slab,
                other => panic!("unexpected lookup {:?}", other),
            };
            pool.free(slab, p, &vm, &fatal);
        }
        assert_eq!(pool.committed_slabs(), 0);
        assert_eq!(pool.high_water_slabs(), 2);
        assert_eq!(pool.taken_blocks(), 0);
        assert_eq!(pool.exhausted_slabs(), 0);

        // The decommitted slab is recommitted, reusing its record.
        let p = pool.alloc(&vm, &fatal).unwrap();
        assert_eq!(pool.committed_slabs(), 1);
        assert_eq!(pool.decommit_all(&vm), 1);
        assert_eq!(pool.committed_slabs(), 0);
        let _ = p;
        unsafe { map.release(&vm) };
    }

    #[test]
    fn lookup_rejects_interior_and_foreign_pointers() {
        for &separate in &[false, true] {
            let (table, mut map, vm) = setup(separate);
            let fatal = fatal();
            let idx = table.index_for_size(48).unwrap();
            let mut pools = map.pools();
            let p = pools[idx].alloc(&vm, &fatal).unwrap().as_ptr() as usize;
            assert!(matches!(map.lookup(p), Lookup::Block { .. }));
            assert_eq!(map.lookup(p + 16), Lookup::Invalid);
            let local = 0u64;
            assert_eq!(map.lookup(&local as *const u64 as usize), Lookup::NotSmall);
            pools[idx].decommit_all(&vm);
            unsafe { map.release(&vm) };
        }
    }

    #[test]
    #[should_panic(expected = "UnrecognizedPointer")]
    fn free_into_unmapped_slab() {
        let (table, map, vm) = setup(false);
        let idx = table.index_for_size(16).unwrap();
        let mut pools = map.pools();
        let p = NonNull::new(map.geometry[idx].slab_addr(3) as *mut u8).unwrap();
        pools[idx].free(3, p, &vm, &fatal());
    }

    #[test]
    fn lookup_follows_slab_commitment() {
        for &separate in &[false, true] {
            let (table, mut map, vm) = setup(separate);
            let fatal = fatal();
            let idx = table.index_for_size(64).unwrap();
            let mut pools = map.pools();
            let p = pools[idx].alloc(&vm, &fatal).unwrap();
            let addr = p.as_ptr() as usize;
            let slab = match map.lookup(addr) {
                Lookup::Block { pool, slab } => {
                    assert_eq!(pool, idx);
                    slab
                }
                other => panic!("unexpected lookup {:?}", other),
            };
            // Blocks are carved from the end of a fresh slab; the free neighbour still resolves.
            assert!(matches!(map.lookup(addr - 64), Lookup::Block { .. }));

            pools[idx].free(slab, p, &vm, &fatal);
            assert_eq!(pools[idx].committed_slabs(), 0);
            assert_eq!(map.lookup(addr), Lookup::Invalid);
            assert_eq!(map.lookup(addr - 64), Lookup::Invalid);

            let q = pools[idx].alloc(&vm, &fatal).unwrap();
            assert_eq!(q.as_ptr() as usize, addr);
            assert!(matches!(map.lookup(addr), Lookup::Block { .. }));
            pools[idx].decommit_all(&vm);
            assert_eq!(map.lookup(addr), Lookup::Invalid);
            unsafe { map.release(&vm) };
        }
    }

    #[test]
    #[should_panic(expected = "UnrecognizedPointer")]
    fn free_into_slab_with_nothing_taken() {
        let (table, map, vm) = setup(false);
        let fatal = fatal();
        let idx = table.index_for_size(32).unwrap();
        let mut pools = map.pools();
        let a = pools[idx].alloc(&vm, &fatal).unwrap();
        let b = pools[idx].alloc(&vm, &fatal).unwrap();
        pools[idx].free(0, a, &vm, &fatal);
        pools[idx].infos[0].taken = 0;
        pools[idx].free(0, b, &vm, &fatal);
    }
}
