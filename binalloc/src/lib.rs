// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A segregated-size ("binned") general-purpose allocator.
//!
//! # Design
//!
//! Requests up to a configurable cutoff (32 KiB by default) are rounded up to one of a fixed,
//! strictly increasing set of block sizes. Each size class owns a range of reserved address
//! space cut into slabs, which are committed on demand and decommitted once their last block is
//! freed. Occupancy of the slabs is tracked with two `BitTree`s per size class, one for
//! committed slabs and one for slabs without free blocks, so finding a slab to allocate from is
//! logarithmic in the size of the range. Since the ranges are fixed, the size class and slab of
//! any block follow from its address alone.
//!
//! Larger requests are mapped straight from the virtual memory backend and recorded in a chained
//! hash index keyed by address.
//!
//! Small frees go to a per-thread cache of free-block bundles. Full bundles move to a bounded
//! global recycler from which any thread can take them, and overflow from there is flushed back
//! to the slabs. The common paths therefore touch no shared lock; the allocator-wide mutex is
//! only taken when a thread runs out of cached blocks or has too many.
//!
//! Bookkeeping records carry canaries. A canary that does not hold the value its lifecycle
//! state demands, like freeing an address the allocator does not recognize, is fatal and is
//! reported through the `FatalHandler` the allocator was built with.
//!
//! # Example
//!
//! ```rust
//! use binalloc::BinnedAllocator;
//!
//! let heap = BinnedAllocator::new();
//! let p = heap.malloc(100, 16);
//! assert_eq!(heap.get_allocation_size(p), Some(112));
//! unsafe { heap.free(p) };
//! ```

#[macro_use]
extern crate log;

#[macro_use]
mod macros;
#[macro_use]
pub mod stats;

mod binned;
mod bit_tree;
mod bundle;
mod config;
mod fatal;
mod large;
mod pool;
mod recycler;
mod size_class;
mod thread_cache;
mod vm;

#[cfg(test)]
mod tests;

pub use binned::BinnedAllocator;
pub use bit_tree::BitTree;
pub use config::{
    AllocatorConfig, AllocatorConfigBuilder, ConfigError, DEFAULT_MAX_MEMORY_PER_BLOCK_SIZE,
    DEFAULT_MAX_SMALL_POOL_SIZE,
};
pub use fatal::{AbortHandler, FatalError, FatalHandler, PanicHandler};
pub use size_class::{SizeClass, SizeClassTable};
pub use stats::{AllocatorStats, PoolStats, StatsSink};
pub use vm::{LargeBlock, MmapVirtualMemory, VirtualMemory, VmBlock, VmError};
