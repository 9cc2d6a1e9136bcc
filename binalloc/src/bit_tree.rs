// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fixed-capacity bitmap with logarithmic first-clear and first-set queries.
//!
//! The bits themselves live in a flat array of leaf words. Above the leaves sit two summary
//! hierarchies of 64-ary words:
//!
//! - In the *full* hierarchy, a bit is set iff the word it summarizes is entirely ones. Walking
//!   it from the root always finds the lowest clear leaf bit.
//! - In the *any* hierarchy, a bit is set iff the word it summarizes is non-zero. Walking it
//!   from the root finds the lowest set leaf bit.
//!
//! Both hierarchies are updated on every change to a leaf, but only as far up as the summary bit
//! actually flips, so updates are O(log64 capacity) in the worst case and O(1) in the common
//! case.
//!
//! Bits past `capacity` in the last leaf do not exist. They read as set in the *full* hierarchy
//! (so they are never handed out) and as clear in the *any* hierarchy.

const WORD_BITS: usize = 64;

pub struct BitTree {
    capacity: u32,
    leaves: Vec<u64>,
    // Level 0 summarizes the leaves; the last level is a single root word.
    full: Vec<Vec<u64>>,
    any: Vec<Vec<u64>>,
}

#[inline]
fn words_for(bits: usize) -> usize {
    (bits + WORD_BITS - 1) / WORD_BITS
}

#[inline]
fn split(i: usize) -> (usize, u64) {
    (i / WORD_BITS, 1u64 << (i % WORD_BITS))
}

impl BitTree {
    /// Create a tree of `capacity` bits, all set to `initial`.
    pub fn new(capacity: u32, initial: bool) -> BitTree {
        alloc_assert!(capacity > 0, "BitTree capacity must be non-zero");
        let n_leaves = words_for(capacity as usize);
        let mut tree = BitTree {
            capacity,
            leaves: vec![0; n_leaves],
            full: Vec::new(),
            any: Vec::new(),
        };
        let mut children = n_leaves;
        loop {
            let words = words_for(children);
            let mut full = vec![0u64; words];
            // Summary slots with no child behind them count as full.
            for slot in children..words * WORD_BITS {
                let (w, m) = split(slot);
                full[w] |= m;
            }
            tree.full.push(full);
            tree.any.push(vec![0u64; words]);
            if words == 1 {
                break;
            }
            children = words;
        }
        if initial {
            tree.fill();
        }
        tree
    }

    fn fill(&mut self) {
        for i in 0..self.capacity as usize {
            let (w, m) = split(i);
            self.leaves[w] |= m;
        }
        for w in 0..self.leaves.len() {
            self.mark_full(0, w);
            self.mark_any(0, w);
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    // Mask of the leaf bits in word `w` that lie beyond `capacity`.
    #[inline]
    fn padding(&self, w: usize) -> u64 {
        let live = self.capacity as usize - w * WORD_BITS;
        if live >= WORD_BITS {
            0
        } else {
            !0u64 << live
        }
    }

    #[inline]
    fn leaf_full(&self, w: usize) -> bool {
        self.leaves[w] | self.padding(w) == !0
    }

    fn mark_full(&mut self, level: usize, child: usize) {
        let (w, m) = split(child);
        let word = &mut self.full[level][w];
        *word |= m;
        if *word == !0 && level + 1 < self.full.len() {
            self.mark_full(level + 1, w);
        }
    }

    fn unmark_full(&mut self, level: usize, child: usize) {
        let (w, m) = split(child);
        let word = &mut self.full[level][w];
        let was_full = *word == !0;
        *word &= !m;
        if was_full && level + 1 < self.full.len() {
            self.unmark_full(level + 1, w);
        }
    }

    fn mark_any(&mut self, level: usize, child: usize) {
        let (w, m) = split(child);
        let word = &mut self.any[level][w];
        let was_empty = *word == 0;
        *word |= m;
        if was_empty && level + 1 < self.any.len() {
            self.mark_any(level + 1, w);
        }
    }

    fn unmark_any(&mut self, level: usize, child: usize) {
        let (w, m) = split(child);
        let word = &mut self.any[level][w];
        *word &= !m;
        if *word == 0 && level + 1 < self.any.len() {
            self.unmark_any(level + 1, w);
        }
    }

    /// Returns whether bit `i` is set.
    #[inline]
    pub fn is_set(&self, i: u32) -> bool {
        alloc_debug_assert!(i < self.capacity);
        let (w, m) = split(i as usize);
        self.leaves[w] & m != 0
    }

    /// Set bit `i`. Setting an already-set bit is a no-op.
    pub fn alloc_bit_at(&mut self, i: u32) {
        alloc_assert!(i < self.capacity, "bit {} out of range {}", i, self.capacity);
        let (w, m) = split(i as usize);
        let old = self.leaves[w];
        if old & m != 0 {
            return;
        }
        self.leaves[w] = old | m;
        if old == 0 {
            self.mark_any(0, w);
        }
        if self.leaf_full(w) {
            self.mark_full(0, w);
        }
    }

    /// Clear bit `i`. Clearing an already-clear bit is a no-op.
    pub fn free_bit(&mut self, i: u32) {
        alloc_assert!(i < self.capacity, "bit {} out of range {}", i, self.capacity);
        let (w, m) = split(i as usize);
        let old = self.leaves[w];
        if old & m == 0 {
            return;
        }
        let was_full = self.leaf_full(w);
        self.leaves[w] = old & !m;
        if was_full {
            self.unmark_full(0, w);
        }
        if self.leaves[w] == 0 {
            self.unmark_any(0, w);
        }
    }

    /// The lowest clear bit, without setting it. `None` if every bit is set.
    pub fn next_free_bit(&self) -> Option<u32> {
        let mut idx = 0usize;
        for level in self.full.iter().rev() {
            let word = level[idx];
            if word == !0 {
                return None;
            }
            idx = idx * WORD_BITS + word.trailing_ones() as usize;
        }
        let word = self.leaves[idx] | self.padding(idx);
        alloc_debug_assert!(word != !0, "full summary out of sync with leaf {}", idx);
        let bit = idx * WORD_BITS + word.trailing_ones() as usize;
        alloc_debug_assert!(bit < self.capacity as usize);
        Some(bit as u32)
    }

    /// The lowest set bit, without clearing it. `None` if no bit is set.
    pub fn next_alloc_bit(&self) -> Option<u32> {
        let mut idx = 0usize;
        for level in self.any.iter().rev() {
            let word = level[idx];
            if word == 0 {
                return None;
            }
            idx = idx * WORD_BITS + word.trailing_zeros() as usize;
        }
        let word = self.leaves[idx];
        alloc_debug_assert!(word != 0, "any summary out of sync with leaf {}", idx);
        Some((idx * WORD_BITS + word.trailing_zeros() as usize) as u32)
    }

    /// Set and return the lowest clear bit, or `None` if the tree is full.
    pub fn alloc_bit(&mut self) -> Option<u32> {
        let i = self.next_free_bit()?;
        self.alloc_bit_at(i);
        Some(i)
    }

    /// Count the set bits with index below `limit`.
    pub fn count_ones(&self, limit: u32) -> u32 {
        let limit = ::std::cmp::min(limit, self.capacity) as usize;
        let (whole, rem) = (limit / WORD_BITS, limit % WORD_BITS);
        let mut n: u32 = self.leaves[..whole].iter().map(|w| w.count_ones()).sum();
        if rem != 0 {
            n += (self.leaves[whole] & ((1u64 << rem) - 1)).count_ones();
        }
        n
    }

    /// Heap bytes used by the tree.
    pub fn memory_bytes(&self) -> usize {
        let words = self.leaves.len()
            + self.full.iter().map(Vec::len).sum::<usize>()
            + self.any.iter().map(Vec::len).sum::<usize>();
        words * ::std::mem::size_of::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    #[test]
    fn alloc_is_lowest_first() {
        let mut t = BitTree::new(200, false);
        for i in 0..200 {
            assert_eq!(t.alloc_bit(), Some(i));
        }
        assert_eq!(t.alloc_bit(), None);
        t.free_bit(130);
        t.free_bit(7);
        assert_eq!(t.next_free_bit(), Some(7));
        assert_eq!(t.alloc_bit(), Some(7));
        assert_eq!(t.alloc_bit(), Some(130));
        assert_eq!(t.alloc_bit(), None);
    }

    #[test]
    fn next_alloc_bit_finds_lowest_set() {
        let mut t = BitTree::new(5000, false);
        assert_eq!(t.next_alloc_bit(), None);
        t.alloc_bit_at(4097);
        assert_eq!(t.next_alloc_bit(), Some(4097));
        t.alloc_bit_at(65);
        assert_eq!(t.next_alloc_bit(), Some(65));
        t.free_bit(65);
        assert_eq!(t.next_alloc_bit(), Some(4097));
        // the query does not clear the bit
        assert_eq!(t.next_alloc_bit(), Some(4097));
        t.free_bit(4097);
        assert_eq!(t.next_alloc_bit(), None);
    }

    #[test]
    fn initially_full() {
        let mut t = BitTree::new(70, true);
        assert_eq!(t.next_free_bit(), None);
        assert_eq!(t.next_alloc_bit(), Some(0));
        assert_eq!(t.count_ones(70), 70);
        t.free_bit(69);
        assert_eq!(t.alloc_bit(), Some(69));
        assert_eq!(t.alloc_bit(), None);
    }

    #[test]
    fn capacity_exactly_one_word_and_one() {
        let mut t = BitTree::new(64, false);
        for i in 0..64 {
            assert_eq!(t.alloc_bit(), Some(i));
        }
        assert_eq!(t.alloc_bit(), None);

        let mut t = BitTree::new(1, false);
        assert_eq!(t.alloc_bit(), Some(0));
        assert_eq!(t.alloc_bit(), None);
        t.free_bit(0);
        assert_eq!(t.next_free_bit(), Some(0));
    }

    #[test]
    fn count_ones_respects_limit() {
        let mut t = BitTree::new(1000, false);
        for i in (0..1000).step_by(3) {
            t.alloc_bit_at(i);
        }
        assert_eq!(t.count_ones(0), 0);
        assert_eq!(t.count_ones(1), 1);
        assert_eq!(t.count_ones(64), 22);
        assert_eq!(t.count_ones(1000), 334);
        assert_eq!(t.count_ones(u32::max_value()), 334);
    }

    #[test]
    fn three_level_tree_matches_naive_model() {
        // 64 * 64 * 3 leaves forces a root above two summary levels.
        const CAP: u32 = 64 * 64 * 3 + 17;
        let mut t = BitTree::new(CAP, false);
        let mut model = vec![false; CAP as usize];
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50_000 {
            let i = rng.gen_range(0..CAP);
            if rng.gen::<bool>() {
                t.alloc_bit_at(i);
                model[i as usize] = true;
            } else {
                t.free_bit(i);
                model[i as usize] = false;
            }
            if rng.gen_range(0..64) == 0 {
                let first_clear = model.iter().position(|b| !*b).map(|p| p as u32);
                let first_set = model.iter().position(|b| *b).map(|p| p as u32);
                assert_eq!(t.next_free_bit(), first_clear);
                assert_eq!(t.next_alloc_bit(), first_set);
            }
        }
        let ones = model.iter().filter(|b| **b).count() as u32;
        assert_eq!(t.count_ones(CAP), ones);
    }
}
