// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The table of block sizes served by the small pools.
//!
//! The table is built once from the configuration and never changes afterwards. Each class
//! records the shape of its slabs: how many pages a slab spans and how many blocks fit in it.
//! The page count is the smallest one that wastes at most 1/64th of the slab; if no page count
//! up to `MAX_SLAB_PAGES` gets there, the least wasteful one is used.

use crate::config::AllocatorConfig;

const BASE_BLOCK_SIZES: &[usize] = &[
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 288, 320, 384, 448, 512, 576, 640, 704,
    768, 896, 1024, 1168, 1360, 1632, 2048, 2336, 2720, 3264, 4096, 4368, 4912, 5456, 6256, 7264,
    8192, 9360, 10912, 13104, 16384, 21840, 32768,
];

const MAX_SLAB_PAGES: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizeClass {
    pub block_size: u32,
    pub blocks_per_slab: u32,
    pub pages_per_slab: u32,
}

impl SizeClass {
    #[inline]
    pub fn slab_bytes(&self, page_size: usize) -> usize {
        self.pages_per_slab as usize * page_size
    }
}

fn block_sizes(config: &AllocatorConfig) -> Vec<usize> {
    let align = config.min_alignment();
    let max = config.max_small_pool_size;
    let mut sizes: Vec<usize> = BASE_BLOCK_SIZES
        .iter()
        .chain(config.custom_block_sizes.iter())
        .cloned()
        .filter(|&s| s % align == 0 && s <= max)
        .collect();
    // Everything up to the cutoff must have a class to land in.
    sizes.push(max);
    sizes.sort();
    sizes.dedup();
    sizes
}

/// The number of size classes `config` would produce.
pub(crate) fn candidate_count(config: &AllocatorConfig) -> usize {
    block_sizes(config).len()
}

fn slab_shape(block_size: usize, page_size: usize) -> (usize, usize) {
    let mut best = None;
    for pages in 1..=MAX_SLAB_PAGES {
        let slab = pages * page_size;
        if slab < block_size {
            continue;
        }
        let blocks = slab / block_size;
        let waste = slab - blocks * block_size;
        if waste * 64 <= slab {
            return (pages, blocks);
        }
        // compare waste / slab against best_waste / best_slab without dividing
        let better = match best {
            None => true,
            Some((_, _, best_waste, best_slab)) => waste * best_slab < best_waste * slab,
        };
        if better {
            best = Some((pages, blocks, waste, slab));
        }
    }
    match best {
        Some((pages, blocks, _, _)) => (pages, blocks),
        // Larger than MAX_SLAB_PAGES pages: one block per slab.
        None => ((block_size + page_size - 1) / page_size, 1),
    }
}

pub struct SizeClassTable {
    classes: Vec<SizeClass>,
    // Indexed by `(size - 1) >> shift`; holds the smallest class that fits.
    size_to_index: Vec<u8>,
    shift: u32,
    max_size: usize,
    page_size: usize,
}

impl SizeClassTable {
    pub fn new(config: &AllocatorConfig) -> SizeClassTable {
        let classes: Vec<SizeClass> = block_sizes(config)
            .into_iter()
            .map(|size| {
                let (pages, blocks) = slab_shape(size, config.page_size);
                SizeClass {
                    block_size: size as u32,
                    blocks_per_slab: blocks as u32,
                    pages_per_slab: pages as u32,
                }
            })
            .collect();
        alloc_assert!(classes.len() <= 256, "{} size classes", classes.len());
        for w in classes.windows(2) {
            alloc_assert!(w[0].block_size < w[1].block_size);
        }

        let shift = config.min_alignment_shift;
        let max_size = config.max_small_pool_size;
        let mut size_to_index = Vec::with_capacity(max_size >> shift);
        let mut idx = 0;
        for slot in 0..(max_size >> shift) {
            let size = (slot + 1) << shift;
            while (classes[idx].block_size as usize) < size {
                idx += 1;
            }
            size_to_index.push(idx as u8);
        }
        SizeClassTable {
            classes,
            size_to_index,
            shift,
            max_size,
            page_size: config.page_size,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline]
    pub fn get(&self, index: usize) -> &SizeClass {
        &self.classes[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter()
    }

    /// The smallest class holding `size` bytes, if `size` fits a small pool at all.
    #[inline]
    pub fn index_for_size(&self, size: usize) -> Option<usize> {
        if size > self.max_size {
            return None;
        }
        let slot = size.saturating_sub(1) >> self.shift;
        Some(self.size_to_index[slot] as usize)
    }

    /// The smallest class holding `size` bytes whose stride keeps every block aligned to
    /// `align`.
    ///
    /// Slabs are page aligned, so block `i` sits at `slab + i * block_size`; every block is
    /// aligned iff `block_size` is a multiple of `align`. Alignments above a page can never be
    /// met this way.
    pub fn index_for(&self, size: usize, align: usize) -> Option<usize> {
        let first = self.index_for_size(size)?;
        if align <= 1 << self.shift {
            return Some(first);
        }
        if align > self.page_size {
            return None;
        }
        (first..self.classes.len()).find(|&i| self.classes[i].block_size as usize % align == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfigBuilder;

    fn table() -> SizeClassTable {
        SizeClassTable::new(&AllocatorConfigBuilder::default().page_size(4096).build().unwrap())
    }

    #[test]
    fn strictly_increasing_and_bounded() {
        let t = table();
        assert_eq!(t.get(0).block_size, 16);
        assert_eq!(t.get(t.len() - 1).block_size as usize, t.max_size());
        for c in t.iter() {
            assert!(c.blocks_per_slab >= 1);
            assert!(c.blocks_per_slab as usize * c.block_size as usize <= c.slab_bytes(4096));
        }
    }

    #[test]
    fn size_lookup_rounds_up() {
        let t = table();
        let size_of = |s| t.get(t.index_for_size(s).unwrap()).block_size;
        assert_eq!(size_of(0), 16);
        assert_eq!(size_of(1), 16);
        assert_eq!(size_of(16), 16);
        assert_eq!(size_of(17), 32);
        assert_eq!(size_of(900), 1024);
        assert_eq!(size_of(32768), 32768);
        assert_eq!(t.index_for_size(32769), None);
        for s in 1..=t.max_size() {
            let c = t.get(t.index_for_size(s).unwrap());
            assert!(c.block_size as usize >= s);
        }
    }

    #[test]
    fn alignment_picks_a_compatible_stride() {
        let t = table();
        // 48 is not a multiple of 32, so the next multiple wins
        let i = t.index_for(40, 32).unwrap();
        assert_eq!(t.get(i).block_size, 64);
        let i = t.index_for(100, 4096).unwrap();
        assert_eq!(t.get(i).block_size, 4096);
        assert_eq!(t.index_for(100, 8192), None);
        let i = t.index_for(24, 8).unwrap();
        assert_eq!(t.get(i).block_size, 32);
    }

    #[test]
    fn slab_shapes_keep_waste_low() {
        assert_eq!(slab_shape(16, 4096), (1, 256));
        assert_eq!(slab_shape(48, 4096), (1, 85));
        let (pages, blocks) = slab_shape(21840, 4096);
        let slab = pages * 4096;
        assert!((slab - blocks * 21840) * 64 <= slab);
    }

    #[test]
    fn custom_sizes_are_merged() {
        let c = AllocatorConfigBuilder::default()
            .page_size(4096)
            .custom_block_sizes(&[208, 64])
            .build()
            .unwrap();
        let t = SizeClassTable::new(&c);
        assert_eq!(t.len(), BASE_BLOCK_SIZES.len() + 1);
        assert_eq!(t.get(t.index_for_size(200).unwrap()).block_size, 208);
    }
}
