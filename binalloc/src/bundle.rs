// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bundles of free blocks, and the two-bundle lists thread caches keep per size class.
//!
//! A bundle is an intrusive singly-linked chain threaded through the free blocks themselves.
//! Blocks are at least 16 bytes, so the link always fits.

use std::ptr::{self, NonNull};

struct BundleNode {
    next: *mut BundleNode,
}

/// A chain of free blocks of one size class, moved between caches as a unit.
pub(crate) struct Bundle {
    head: *mut BundleNode,
    count: u32,
}

// A bundle owns its blocks; whoever holds it may hand them out from any thread.
unsafe impl Send for Bundle {}

impl Bundle {
    pub(crate) const EMPTY: Bundle = Bundle {
        head: ptr::null_mut(),
        count: 0,
    };

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.count
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// # Safety
    ///
    /// `block` must be a free block this bundle may overwrite and own.
    #[inline]
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
        let node = block.as_ptr() as *mut BundleNode;
        (*node).next = self.head;
        self.head = node;
        self.count += 1;
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = NonNull::new(self.head)?;
        unsafe {
            self.head = (*node.as_ptr()).next;
        }
        self.count -= 1;
        Some(node.cast())
    }

    #[inline]
    fn take_bundle(&mut self) -> Bundle {
        ::std::mem::replace(self, Bundle::EMPTY)
    }
}

impl Iterator for Bundle {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<NonNull<u8>> {
        self.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.count as usize, Some(self.count as usize))
    }
}

/// The per-size-class cache of one thread: a `partial` bundle being filled or drained, and at
/// most one `full` bundle waiting to be handed to the global recycler.
pub(crate) struct FreeBlockList {
    partial: Bundle,
    full: Bundle,
    bundle_capacity: u32,
}

impl FreeBlockList {
    /// A list whose bundles fill at `max_count` blocks or `max_bytes` bytes of `block_size`
    /// blocks, whichever comes first.
    pub(crate) fn new(block_size: usize, max_count: u32, max_bytes: usize) -> FreeBlockList {
        let by_bytes = ::std::cmp::max(1, max_bytes / block_size);
        FreeBlockList {
            partial: Bundle::EMPTY,
            full: Bundle::EMPTY,
            bundle_capacity: ::std::cmp::min(max_count as usize, by_bytes) as u32,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.partial.len() + self.full.len()
    }

    /// Whether a `push` would succeed.
    #[inline]
    pub(crate) fn has_room(&self) -> bool {
        self.partial.len() < self.bundle_capacity || self.full.is_empty()
    }

    /// Cache a free block. Returns false, leaving the list unchanged, when both bundles are
    /// full; the caller must move the full bundle elsewhere first.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of this list's size class.
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) -> bool {
        if self.partial.len() >= self.bundle_capacity {
            if !self.full.is_empty() {
                return false;
            }
            self.full = self.partial.take_bundle();
        }
        self.partial.push(block);
        true
    }

    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.partial.is_empty() {
            self.partial = self.full.take_bundle();
        }
        self.partial.pop()
    }

    /// Take the full bundle, if any.
    pub(crate) fn take_full(&mut self) -> Option<Bundle> {
        if self.full.is_empty() {
            None
        } else {
            Some(self.full.take_bundle())
        }
    }

    /// Install a bundle from the recycler as the partial bundle. The list must be empty.
    pub(crate) fn refill(&mut self, bundle: Bundle) {
        alloc_debug_assert!(self.partial.is_empty() && self.full.is_empty());
        self.partial = bundle;
    }

    /// Empty the list, returning both bundles.
    pub(crate) fn take_all(&mut self) -> (Bundle, Bundle) {
        (self.partial.take_bundle(), self.full.take_bundle())
    }
}
