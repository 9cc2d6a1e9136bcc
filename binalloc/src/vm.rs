// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The virtual-memory capability the allocator is built on.
//!
//! The allocator never talks to the operating system directly. It reserves address ranges,
//! commits and decommits pages inside them, and maps whole blocks for large allocations through
//! a `VirtualMemory` implementation handed to it at construction. `MmapVirtualMemory` is the
//! default implementation for Unix systems.
//!
//! # Commit model
//!
//! A reserved range is inaccessible until it is committed. Decommitting returns the physical
//! pages to the system and makes the range inaccessible again; a later commit yields zeroed
//! pages. Large blocks come back committed.

#[cfg(not(unix))]
compile_error!("binalloc's default virtual memory backend only supports Unix systems");

use std::ptr::{self, NonNull};

use errno::errno;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("the system is out of address space or memory")]
    Exhausted,
    #[error("alignment {align} exceeds the allocation granularity {granularity}")]
    AlignmentTooLarge { align: usize, granularity: usize },
}

/// A reserved range of address space.
#[derive(Debug, PartialEq, Eq)]
pub struct VmBlock {
    ptr: NonNull<u8>,
    size: usize,
}

// A VmBlock is an address range; it carries no access to the memory on its own.
unsafe impl Send for VmBlock {}
unsafe impl Sync for VmBlock {}

impl VmBlock {
    /// # Safety
    ///
    /// `ptr..ptr + size` must be a range reserved from the `VirtualMemory` it will be returned
    /// to.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, size: usize) -> VmBlock {
        VmBlock { ptr, size }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr - self.start() < self.size
    }
}

/// A committed block mapped for a single large allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LargeBlock {
    pub ptr: NonNull<u8>,
    /// Bytes committed at `ptr`, a multiple of the allocation granularity.
    pub commit_size: usize,
    /// Size of the mapping in units of the allocation granularity; needed to free it.
    pub vm_units: usize,
}

pub trait VirtualMemory: Send + Sync {
    fn page_size(&self) -> usize;

    /// The unit large blocks are sized and aligned to.
    fn allocation_granularity(&self) -> usize;

    /// Reserve at least `size` bytes of address space without committing any of it.
    fn reserve(&self, size: usize) -> Result<VmBlock, VmError>;

    /// Commit `size` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// The range must be page aligned and lie within a reservation or large block owned by
    /// this `VirtualMemory`.
    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit `size` bytes at `ptr`. Same requirements as `commit`.
    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize);

    /// Give a reservation back to the system.
    ///
    /// # Safety
    ///
    /// Nothing inside the range may be accessed afterwards.
    unsafe fn release(&self, block: VmBlock);

    /// Map a committed, zero-filled block of at least `size` bytes aligned to `align`.
    fn allocate_large(&self, size: usize, align: usize) -> Result<LargeBlock, VmError>;

    /// Unmap a block returned by `allocate_large`.
    ///
    /// # Safety
    ///
    /// `ptr` and `vm_units` must come from the same `LargeBlock`, which must not be used again.
    unsafe fn free_large(&self, ptr: NonNull<u8>, vm_units: usize);
}

/// `size` rounded up to a multiple of `unit`, or `None` if that does not fit in a `usize`.
#[inline]
pub(crate) fn next_multiple(size: usize, unit: usize) -> Option<usize> {
    alloc_debug_assert!(unit.is_power_of_two());
    Some(size.checked_add(unit - 1)? & !(unit - 1))
}

/// `VirtualMemory` backed by `mmap`, `mprotect` and `madvise`.
#[derive(Copy, Clone, Debug)]
pub struct MmapVirtualMemory {
    // sysconf::page::pagesize might be inefficient, so keep a copy.
    page_size: usize,
    granularity: usize,
}

impl Default for MmapVirtualMemory {
    fn default() -> MmapVirtualMemory {
        let page_size = sysconf::page::pagesize();
        MmapVirtualMemory {
            page_size,
            granularity: page_size,
        }
    }
}

impl MmapVirtualMemory {
    /// A backend whose large blocks are aligned to `granularity`, which must be a power-of-two
    /// multiple of the system page size.
    pub fn with_granularity(granularity: usize) -> MmapVirtualMemory {
        let page_size = sysconf::page::pagesize();
        alloc_assert!(
            granularity.is_power_of_two() && granularity >= page_size,
            "granularity {} incompatible with page size {}",
            granularity,
            page_size
        );
        MmapVirtualMemory {
            page_size,
            granularity,
        }
    }
}

unsafe fn map(size: usize, prot: libc::c_int, extra_flags: libc::c_int) -> Option<NonNull<u8>> {
    let ptr = libc::mmap(
        ptr::null_mut(),
        size,
        prot,
        libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        warn!("mmap of {} bytes failed: {}", size, errno());
        None
    } else {
        // Without MAP_FIXED, POSIX guarantees the mapping is never placed at address 0.
        NonNull::new(ptr as *mut u8)
    }
}

unsafe fn unmap(ptr: *mut u8, size: usize) {
    let ret = libc::munmap(ptr as *mut _, size);
    alloc_assert!(ret == 0, "munmap failed: {}", errno());
}

impl VirtualMemory for MmapVirtualMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocation_granularity(&self) -> usize {
        self.granularity
    }

    fn reserve(&self, size: usize) -> Result<VmBlock, VmError> {
        let size = next_multiple(size, self.granularity).ok_or(VmError::Exhausted)?;
        let ptr = unsafe { map(size, libc::PROT_NONE, libc::MAP_NORESERVE) }
            .ok_or(VmError::Exhausted)?;
        trace!("reserved {} bytes at {:?}", size, ptr);
        Ok(VmBlock { ptr, size })
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        alloc_debug_assert!(ptr.as_ptr() as usize % self.page_size == 0);
        let ret = libc::mprotect(
            ptr.as_ptr() as *mut _,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        if ret == 0 {
            Ok(())
        } else {
            warn!("commit of {} bytes at {:?} failed: {}", size, ptr, errno());
            Err(VmError::Exhausted)
        }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) {
        alloc_debug_assert!(ptr.as_ptr() as usize % self.page_size == 0);
        libc::madvise(ptr.as_ptr() as *mut _, size, libc::MADV_DONTNEED);
        let ret = libc::mprotect(ptr.as_ptr() as *mut _, size, libc::PROT_NONE);
        alloc_assert!(ret == 0, "mprotect failed: {}", errno());
    }

    unsafe fn release(&self, block: VmBlock) {
        trace!("releasing {} bytes at {:?}", block.size, block.ptr);
        unmap(block.ptr.as_ptr(), block.size);
    }

    fn allocate_large(&self, size: usize, align: usize) -> Result<LargeBlock, VmError> {
        if align > self.granularity {
            return Err(VmError::AlignmentTooLarge {
                align,
                granularity: self.granularity,
            });
        }
        let commit_size = next_multiple(size, self.granularity).ok_or(VmError::Exhausted)?;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let ptr = if self.granularity == self.page_size {
            unsafe { map(commit_size, prot, 0) }.ok_or(VmError::Exhausted)?
        } else {
            // Map a larger region, then unmap all but a granularity-aligned subset of it.
            let padded = commit_size
                .checked_add(self.granularity - self.page_size)
                .ok_or(VmError::Exhausted)?;
            let raw = unsafe { map(padded, prot, 0) }.ok_or(VmError::Exhausted)?;
            let start = raw.as_ptr() as usize;
            // The mapping extends past the aligned address, so this cannot overflow.
            let aligned = (start + self.granularity - 1) & !(self.granularity - 1);
            unsafe {
                if aligned > start {
                    unmap(raw.as_ptr(), aligned - start);
                }
                let tail = start + padded - (aligned + commit_size);
                if tail > 0 {
                    unmap((aligned + commit_size) as *mut u8, tail);
                }
                NonNull::new_unchecked(aligned as *mut u8)
            }
        };
        trace!("mapped large block of {} bytes at {:?}", commit_size, ptr);
        Ok(LargeBlock {
            ptr,
            commit_size,
            vm_units: commit_size / self.granularity,
        })
    }

    unsafe fn free_large(&self, ptr: NonNull<u8>, vm_units: usize) {
        trace!("unmapping large block at {:?}", ptr);
        unmap(ptr.as_ptr(), vm_units * self.granularity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn test_write_read(ptr: *mut u8, size: usize) {
        for i in 0..size {
            *ptr.add(i) = (i & 0xff) as u8;
        }
        for i in 0..size {
            assert_eq!(*ptr.add(i), (i & 0xff) as u8, "mismatch at byte {}", i);
        }
    }

    #[test]
    fn reserve_commit_decommit() {
        let vm = MmapVirtualMemory::default();
        let page = vm.page_size();
        let block = vm.reserve(16 * page).unwrap();
        assert_eq!(block.start() % page, 0);
        assert!(block.contains(block.start()));
        assert!(block.contains(block.start() + 16 * page - 1));
        assert!(!block.contains(block.start() + 16 * page));
        unsafe {
            let second = NonNull::new_unchecked(block.base().as_ptr().add(page));
            vm.commit(second, 2 * page).unwrap();
            test_write_read(second.as_ptr(), 2 * page);
            vm.decommit(second, 2 * page);
            // Recommitted pages come back zeroed.
            vm.commit(second, page).unwrap();
            assert_eq!(*second.as_ptr(), 0);
            vm.release(block);
        }
    }

    #[test]
    fn large_blocks_are_granularity_aligned() {
        let page = sysconf::page::pagesize();
        let vm = MmapVirtualMemory::with_granularity(page * 16);
        let b = vm.allocate_large(page * 3 + 1, page * 16).unwrap();
        assert_eq!(b.ptr.as_ptr() as usize % (page * 16), 0);
        assert_eq!(b.commit_size, page * 16);
        assert_eq!(b.vm_units, 1);
        unsafe {
            test_write_read(b.ptr.as_ptr(), b.commit_size);
            vm.free_large(b.ptr, b.vm_units);
        }
        assert_eq!(
            vm.allocate_large(page, page * 32),
            Err(VmError::AlignmentTooLarge {
                align: page * 32,
                granularity: page * 16,
            })
        );
    }

    #[test]
    fn oversized_requests_are_exhausted() {
        let page = sysconf::page::pagesize();
        for &granularity in &[page, page * 4] {
            let vm = MmapVirtualMemory::with_granularity(granularity);
            for &size in &[usize::MAX, usize::MAX - 100, usize::MAX - granularity + 2] {
                assert_eq!(vm.allocate_large(size, 16), Err(VmError::Exhausted));
                assert_eq!(vm.reserve(size), Err(VmError::Exhausted));
            }
        }
        assert_eq!(next_multiple(usize::MAX - 4095, 4096), Some(usize::MAX - 4095));
        assert_eq!(next_multiple(usize::MAX - 4094, 4096), None);
        assert_eq!(next_multiple(0, 4096), Some(0));
        assert_eq!(next_multiple(4097, 4096), Some(8192));
    }
}
