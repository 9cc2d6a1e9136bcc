// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocator configuration.
//!
//! New configurations are made with `AllocatorConfigBuilder::default()`, adjusted with its
//! chained setters, and validated by `build`.

use std::time::Duration;

use thiserror::Error;

/// Largest request, in bytes, served from the small pools by default.
pub const DEFAULT_MAX_SMALL_POOL_SIZE: usize = 32 << 10;
/// Address space reserved for each size class by default.
pub const DEFAULT_MAX_MEMORY_PER_BLOCK_SIZE: usize = 256 << 20;

const MAX_POOLS: usize = 256;

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("page size {0} is not a power of two")]
    PageSize(usize),
    #[error("commit granularity {granularity} is not a power-of-two multiple of the page size {page_size}")]
    Granularity { granularity: usize, page_size: usize },
    #[error("minimum alignment shift {0} is out of range")]
    AlignmentShift(u32),
    #[error("block size {size} is zero or not a multiple of the minimum alignment {align}")]
    BlockSize { size: usize, align: usize },
    #[error("max small pool size {0} is not a multiple of the minimum alignment or exceeds the per-class memory ceiling")]
    MaxSmallPoolSize(usize),
    #[error("{0} size classes requested, at most 256 are supported")]
    TooManyPools(usize),
    #[error("bundles must hold at least one block and the recycler at least one bundle")]
    Bundles,
    #[error("large hash bucket count {0} is not a power of two")]
    HashBuckets(usize),
    #[error("page size {page_size} is not a multiple of the backend's page size {backend}")]
    BackendPageSize { page_size: usize, backend: usize },
}

/// A validated allocator configuration.
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    pub page_size: usize,
    pub commit_granularity: usize,
    pub min_alignment_shift: u32,
    pub max_memory_per_block_size: usize,
    pub max_small_pool_size: usize,
    pub per_thread_caches: bool,
    pub max_global_bundles: usize,
    pub bundle_max_count: u32,
    pub bundle_max_bytes: usize,
    pub alloc_extra: u32,
    pub custom_block_sizes: Vec<usize>,
    pub separate_vm_per_pool: bool,
    pub large_hash_buckets: usize,
    pub trim_warn_threshold: Duration,
}

impl AllocatorConfig {
    #[inline]
    pub fn min_alignment(&self) -> usize {
        1 << self.min_alignment_shift
    }
}

impl Default for AllocatorConfig {
    fn default() -> AllocatorConfig {
        AllocatorConfigBuilder::default().config
    }
}

/// A builder for `AllocatorConfig`.
pub struct AllocatorConfigBuilder {
    config: AllocatorConfig,
}

impl Default for AllocatorConfigBuilder {
    fn default() -> AllocatorConfigBuilder {
        let page_size = sysconf::page::pagesize();
        AllocatorConfigBuilder {
            config: AllocatorConfig {
                page_size,
                commit_granularity: page_size,
                min_alignment_shift: 4,
                max_memory_per_block_size: DEFAULT_MAX_MEMORY_PER_BLOCK_SIZE,
                max_small_pool_size: DEFAULT_MAX_SMALL_POOL_SIZE,
                per_thread_caches: true,
                max_global_bundles: 32,
                bundle_max_count: 64,
                bundle_max_bytes: 8192,
                alloc_extra: 32,
                custom_block_sizes: Vec::new(),
                separate_vm_per_pool: false,
                large_hash_buckets: 1024,
                trim_warn_threshold: Duration::from_millis(10),
            },
        }
    }
}

impl AllocatorConfigBuilder {
    /// Overrides the OS page size (the unit slabs are made of).
    pub fn page_size(mut self, page_size: usize) -> Self {
        if self.config.commit_granularity < page_size {
            self.config.commit_granularity = page_size;
        }
        self.config.page_size = page_size;
        self
    }

    /// Sets the granularity that large allocations are committed and aligned to.
    pub fn commit_granularity(mut self, granularity: usize) -> Self {
        self.config.commit_granularity = granularity;
        self
    }

    /// Sets the minimum alignment (and size-class quantum) as a power of two.
    pub fn min_alignment_shift(mut self, shift: u32) -> Self {
        self.config.min_alignment_shift = shift;
        self
    }

    /// Sets the address space reserved for each size class.
    pub fn max_memory_per_block_size(mut self, bytes: usize) -> Self {
        self.config.max_memory_per_block_size = bytes;
        self
    }

    /// Sets the largest request served from slabs. Block sizes above it are dropped.
    pub fn max_small_pool_size(mut self, bytes: usize) -> Self {
        self.config.max_small_pool_size = bytes;
        self
    }

    pub fn per_thread_caches(mut self, enabled: bool) -> Self {
        self.config.per_thread_caches = enabled;
        self
    }

    /// Sets how many bundles per size class the global recycler holds.
    pub fn max_global_bundles(mut self, n: usize) -> Self {
        self.config.max_global_bundles = n;
        self
    }

    /// Sets when a thread-cache bundle counts as full: `count` blocks or `bytes` bytes,
    /// whichever comes first.
    pub fn bundle_limits(mut self, count: u32, bytes: usize) -> Self {
        self.config.bundle_max_count = count;
        self.config.bundle_max_bytes = bytes;
        self
    }

    /// Sets how many extra blocks a slow-path allocation moves into the thread cache.
    pub fn alloc_extra(mut self, n: u32) -> Self {
        self.config.alloc_extra = n;
        self
    }

    /// Adds block sizes to the size-class table.
    pub fn custom_block_sizes(mut self, sizes: &[usize]) -> Self {
        self.config.custom_block_sizes.extend_from_slice(sizes);
        self
    }

    /// Reserves a separate address range per size class instead of one shared range.
    pub fn separate_vm_per_pool(mut self, separate: bool) -> Self {
        self.config.separate_vm_per_pool = separate;
        self
    }

    pub fn large_hash_buckets(mut self, n: usize) -> Self {
        self.config.large_hash_buckets = n;
        self
    }

    pub fn trim_warn_threshold(mut self, threshold: Duration) -> Self {
        self.config.trim_warn_threshold = threshold;
        self
    }

    pub fn build(self) -> Result<AllocatorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl AllocatorConfig {
    /// Check the invariants `AllocatorConfigBuilder::build` enforces. The fields are public, so
    /// a configuration may have been changed since it was built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = self;
        if !c.page_size.is_power_of_two() {
            return Err(ConfigError::PageSize(c.page_size));
        }
        if !c.commit_granularity.is_power_of_two() || c.commit_granularity < c.page_size {
            return Err(ConfigError::Granularity {
                granularity: c.commit_granularity,
                page_size: c.page_size,
            });
        }
        // The free-block header needs 16 bytes, and blocks must fit in a page-aligned slab.
        if c.min_alignment_shift < 4 || (1usize << c.min_alignment_shift) > c.page_size {
            return Err(ConfigError::AlignmentShift(c.min_alignment_shift));
        }
        let align = c.min_alignment();
        if c.max_small_pool_size == 0
            || c.max_small_pool_size % align != 0
            || c.max_small_pool_size > c.max_memory_per_block_size
        {
            return Err(ConfigError::MaxSmallPoolSize(c.max_small_pool_size));
        }
        for &size in &c.custom_block_sizes {
            if size == 0 || size % align != 0 {
                return Err(ConfigError::BlockSize { size, align });
            }
        }
        if c.bundle_max_count == 0 || c.bundle_max_bytes == 0 || c.max_global_bundles == 0 {
            return Err(ConfigError::Bundles);
        }
        if !c.large_hash_buckets.is_power_of_two() {
            return Err(ConfigError::HashBuckets(c.large_hash_buckets));
        }
        let n = crate::size_class::candidate_count(&c);
        if n > MAX_POOLS {
            return Err(ConfigError::TooManyPools(n));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = AllocatorConfig::default();
        assert_eq!(c.min_alignment(), 16);
        assert!(c.page_size.is_power_of_two());
        assert_eq!(c.commit_granularity, c.page_size);
        assert!(c.per_thread_caches);
    }

    #[test]
    fn rejects_bad_values() {
        let r = AllocatorConfigBuilder::default().commit_granularity(3000).build();
        assert!(matches!(r, Err(ConfigError::Granularity { .. })));
        let r = AllocatorConfigBuilder::default().custom_block_sizes(&[40]).build();
        assert_eq!(r.unwrap_err(), ConfigError::BlockSize { size: 40, align: 16 });
        let r = AllocatorConfigBuilder::default().large_hash_buckets(1000).build();
        assert_eq!(r.unwrap_err(), ConfigError::HashBuckets(1000));
        let r = AllocatorConfigBuilder::default().bundle_limits(0, 8192).build();
        assert_eq!(r.unwrap_err(), ConfigError::Bundles);
        let r = AllocatorConfigBuilder::default().min_alignment_shift(3).build();
        assert_eq!(r.unwrap_err(), ConfigError::AlignmentShift(3));
    }

    #[test]
    fn too_many_custom_sizes() {
        let sizes: Vec<usize> = (1..400).map(|i| i * 16).collect();
        let r = AllocatorConfigBuilder::default()
            .max_small_pool_size(400 * 16)
            .custom_block_sizes(&sizes)
            .build();
        assert!(matches!(r, Err(ConfigError::TooManyPools(_))));
    }

    #[test]
    fn validate_catches_later_edits() {
        let mut c = AllocatorConfigBuilder::default().build().unwrap();
        assert_eq!(c.validate(), Ok(()));
        c.large_hash_buckets = 3;
        assert_eq!(c.validate(), Err(ConfigError::HashBuckets(3)));
    }
}
