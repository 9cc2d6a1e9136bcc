// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bookkeeping for allocations too big for any size class.
//!
//! Large blocks are aligned to the allocation granularity, so an address is first reduced to
//! its granularity unit. Records are stored in page-sized arrays of `PoolInfoLarge`, one array
//! per group of consecutive units:
//!
//! ```text
//! units  = addr >> log2(granularity)
//! slot   = units % PER_PAGE        (record within the array)
//! group  = units / PER_PAGE
//! bucket = group & (buckets - 1)   (hash slot)
//! key    = group >> log2(buckets)  (tells apart groups sharing a slot)
//! ```
//!
//! Each hash slot heads a circular doubly-linked chain of `HashBucket`s, one per group that
//! currently has a live record. Buckets and their arrays live in arenas addressed by index;
//! a bucket whose array empties is unlinked and put on a free list for the next group that
//! needs one. The table never rehashes.

use std::mem;
use std::ptr::NonNull;

use crate::fatal::Fatal;

const LARGE_ASSIGNED: u16 = 0x6a5e;
const LARGE_UNASSIGNED: u16 = 0x0d1e;
const NIL: u32 = u32::MAX;

#[derive(Copy, Clone, Debug)]
pub(crate) struct PoolInfoLarge {
    canary: u16,
    pub requested_bytes: usize,
    pub committed_bytes: usize,
    pub vm_units: usize,
}

impl PoolInfoLarge {
    const UNASSIGNED: PoolInfoLarge = PoolInfoLarge {
        canary: LARGE_UNASSIGNED,
        requested_bytes: 0,
        committed_bytes: 0,
        vm_units: 0,
    };
}

struct HashBucket {
    key: usize,
    live: u32,
    prev: u32,
    next: u32,
}

pub(crate) struct LargeAllocationHashIndex {
    granularity_shift: u32,
    per_page: usize,
    bucket_bits: u32,
    heads: Vec<u32>,
    buckets: Vec<HashBucket>,
    // pages[i] belongs to buckets[i]
    pages: Vec<Box<[PoolInfoLarge]>>,
    free_buckets: u32,
    live: usize,
    requested: usize,
    committed: usize,
}

struct Position {
    slot: usize,
    bucket: usize,
    key: usize,
}

impl LargeAllocationHashIndex {
    pub(crate) fn new(granularity: usize, page_size: usize, buckets: usize) -> Self {
        alloc_assert!(granularity.is_power_of_two() && buckets.is_power_of_two());
        LargeAllocationHashIndex {
            granularity_shift: granularity.trailing_zeros(),
            per_page: page_size / mem::size_of::<PoolInfoLarge>(),
            bucket_bits: buckets.trailing_zeros(),
            heads: vec![NIL; buckets],
            buckets: Vec::new(),
            pages: Vec::new(),
            free_buckets: NIL,
            live: 0,
            requested: 0,
            committed: 0,
        }
    }

    fn position(&self, addr: usize) -> Position {
        let units = addr >> self.granularity_shift;
        let group = units / self.per_page;
        Position {
            slot: units % self.per_page,
            bucket: group & ((1 << self.bucket_bits) - 1),
            key: group >> self.bucket_bits,
        }
    }

    fn address_of(&self, bucket: usize, key: usize, slot: usize) -> usize {
        let group = (key << self.bucket_bits) | bucket;
        (group * self.per_page + slot) << self.granularity_shift
    }

    fn find_bucket(&self, pos: &Position) -> Option<u32> {
        let head = self.heads[pos.bucket];
        if head == NIL {
            return None;
        }
        let mut cur = head;
        loop {
            let b = &self.buckets[cur as usize];
            if b.key == pos.key {
                return Some(cur);
            }
            cur = b.next;
            if cur == head {
                return None;
            }
        }
    }

    fn new_bucket(&mut self, pos: &Position) -> u32 {
        let idx = if self.free_buckets != NIL {
            let idx = self.free_buckets;
            self.free_buckets = self.buckets[idx as usize].next;
            idx
        } else {
            self.buckets.push(HashBucket {
                key: 0,
                live: 0,
                prev: NIL,
                next: NIL,
            });
            self.pages
                .push(vec![PoolInfoLarge::UNASSIGNED; self.per_page].into_boxed_slice());
            (self.buckets.len() - 1) as u32
        };
        let head = self.heads[pos.bucket];
        let (prev, next) = if head == NIL {
            self.heads[pos.bucket] = idx;
            (idx, idx)
        } else {
            let tail = self.buckets[head as usize].prev;
            self.buckets[tail as usize].next = idx;
            self.buckets[head as usize].prev = idx;
            (tail, head)
        };
        let b = &mut self.buckets[idx as usize];
        b.key = pos.key;
        b.live = 0;
        b.prev = prev;
        b.next = next;
        idx
    }

    fn unlink_bucket(&mut self, slot: usize, idx: u32) {
        let (prev, next) = {
            let b = &self.buckets[idx as usize];
            (b.prev, b.next)
        };
        if next == idx {
            self.heads[slot] = NIL;
        } else {
            self.buckets[prev as usize].next = next;
            self.buckets[next as usize].prev = prev;
            if self.heads[slot] == idx {
                self.heads[slot] = next;
            }
        }
        self.buckets[idx as usize].next = self.free_buckets;
        self.free_buckets = idx;
    }

    /// The record slot for `addr`, splicing in a bucket for its group if there is none.
    fn get_or_create(&mut self, addr: usize) -> (u32, usize) {
        let pos = self.position(addr);
        let bucket = match self.find_bucket(&pos) {
            Some(b) => b,
            None => self.new_bucket(&pos),
        };
        (bucket, pos.slot)
    }

    /// Record a new large allocation at `addr`.
    pub(crate) fn insert(
        &mut self,
        addr: usize,
        requested_bytes: usize,
        committed_bytes: usize,
        vm_units: usize,
        fatal: &Fatal,
    ) {
        let (bucket, slot) = self.get_or_create(addr);
        let info = &mut self.pages[bucket as usize][slot];
        if info.canary != LARGE_UNASSIGNED {
            fatal.corruption(
                "PoolInfoLarge",
                u32::from(LARGE_UNASSIGNED),
                u32::from(info.canary),
            );
        }
        *info = PoolInfoLarge {
            canary: LARGE_ASSIGNED,
            requested_bytes,
            committed_bytes,
            vm_units,
        };
        self.buckets[bucket as usize].live += 1;
        self.live += 1;
        self.requested += requested_bytes;
        self.committed += committed_bytes;
    }

    /// The live record for `addr`, or `None` if `addr` is not a live large allocation.
    pub(crate) fn find(&self, addr: usize, fatal: &Fatal) -> Option<PoolInfoLarge> {
        if addr & ((1 << self.granularity_shift) - 1) != 0 {
            return None;
        }
        let pos = self.position(addr);
        let bucket = self.find_bucket(&pos)?;
        let info = self.pages[bucket as usize][pos.slot];
        match info.canary {
            LARGE_ASSIGNED => Some(info),
            LARGE_UNASSIGNED => None,
            other => fatal.corruption("PoolInfoLarge", u32::from(LARGE_ASSIGNED), u32::from(other)),
        }
    }

    /// Update the sizes of a live record after an in-place resize.
    pub(crate) fn resize(&mut self, addr: usize, requested_bytes: usize, committed_bytes: usize) {
        let pos = self.position(addr);
        if let Some(bucket) = self.find_bucket(&pos) {
            let info = &mut self.pages[bucket as usize][pos.slot];
            alloc_assert!(info.canary == LARGE_ASSIGNED);
            self.requested = self.requested - info.requested_bytes + requested_bytes;
            self.committed = self.committed - info.committed_bytes + committed_bytes;
            info.requested_bytes = requested_bytes;
            info.committed_bytes = committed_bytes;
        }
    }

    /// Forget the record for `addr`, returning it. `None` if there was no live record; a
    /// second removal of the same address lands here.
    pub(crate) fn remove(&mut self, addr: usize, fatal: &Fatal) -> Option<PoolInfoLarge> {
        let info = self.find(addr, fatal)?;
        let pos = self.position(addr);
        let bucket = self.find_bucket(&pos)?;
        self.pages[bucket as usize][pos.slot].canary = LARGE_UNASSIGNED;
        self.live -= 1;
        self.requested -= info.requested_bytes;
        self.committed -= info.committed_bytes;
        let b = &mut self.buckets[bucket as usize];
        b.live -= 1;
        if b.live == 0 {
            self.unlink_bucket(pos.bucket, bucket);
        }
        Some(info)
    }

    /// Remove every live record, returning each block's address and size in granularity
    /// units.
    pub(crate) fn drain(&mut self) -> Vec<(NonNull<u8>, usize)> {
        let mut out = Vec::with_capacity(self.live);
        for slot in 0..self.heads.len() {
            while self.heads[slot] != NIL {
                let idx = self.heads[slot];
                let key = self.buckets[idx as usize].key;
                for i in 0..self.per_page {
                    let info = self.pages[idx as usize][i];
                    if info.canary == LARGE_ASSIGNED {
                        let addr = self.address_of(slot, key, i);
                        if let Some(ptr) = NonNull::new(addr as *mut u8) {
                            out.push((ptr, info.vm_units));
                        }
                        self.pages[idx as usize][i] = PoolInfoLarge::UNASSIGNED;
                    }
                }
                self.buckets[idx as usize].live = 0;
                self.unlink_bucket(slot, idx);
            }
        }
        self.live = 0;
        self.requested = 0;
        self.committed = 0;
        out
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn requested_bytes(&self) -> usize {
        self.requested
    }

    pub(crate) fn committed_bytes(&self) -> usize {
        self.committed
    }

    pub(crate) fn bookkeeping_bytes(&self) -> usize {
        self.heads.capacity() * mem::size_of::<u32>()
            + self.buckets.capacity() * mem::size_of::<HashBucket>()
            + self.pages.len() * self.per_page * mem::size_of::<PoolInfoLarge>()
    }

    #[cfg(test)]
    fn chain_len(&self, addr: usize) -> usize {
        let slot = self.position(addr).bucket;
        let head = self.heads[slot];
        if head == NIL {
            return 0;
        }
        let (mut n, mut cur) = (1, self.buckets[head as usize].next);
        while cur != head {
            n += 1;
            cur = self.buckets[cur as usize].next;
        }
        n
    }
}
