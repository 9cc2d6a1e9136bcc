// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The global recycler: a bounded stack of full bundles per size class, shared by all threads.
//!
//! Each size class has its own spin lock, held only to push or pop one bundle. The stacks are
//! preallocated at their bound, so neither operation allocates.

use spin::Mutex;

use crate::bundle::Bundle;

pub(crate) struct GlobalRecycler {
    slots: Box<[Mutex<Vec<Bundle>>]>,
    max_bundles: usize,
}

impl GlobalRecycler {
    pub(crate) fn new(pools: usize, max_bundles: usize) -> GlobalRecycler {
        GlobalRecycler {
            slots: (0..pools)
                .map(|_| Mutex::new(Vec::with_capacity(max_bundles)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            max_bundles,
        }
    }

    /// Offer a bundle. Hands it back if the size class is at capacity.
    pub(crate) fn push(&self, pool: usize, bundle: Bundle) -> Result<(), Bundle> {
        let mut slot = self.slots[pool].lock();
        if slot.len() >= self.max_bundles {
            return Err(bundle);
        }
        slot.push(bundle);
        Ok(())
    }

    pub(crate) fn pop(&self, pool: usize) -> Option<Bundle> {
        self.slots[pool].lock().pop()
    }

    /// Remove every bundle of one size class.
    pub(crate) fn drain(&self, pool: usize) -> Vec<Bundle> {
        let mut slot = self.slots[pool].lock();
        let mut out = Vec::with_capacity(slot.len());
        out.extend(slot.drain(..));
        out
    }

    /// (bundles, blocks) currently held.
    pub(crate) fn occupancy(&self) -> (usize, u64) {
        self.slots.iter().fold((0, 0), |(bundles, blocks), slot| {
            let slot = slot.lock();
            (
                bundles + slot.len(),
                blocks + slot.iter().map(|b| u64::from(b.len())).sum::<u64>(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    #[test]
    fn bounded_per_class() {
        let mut storage = vec![[0u64; 2]; 4];
        let r = GlobalRecycler::new(2, 2);
        for cell in storage.iter_mut().take(3) {
            let mut b = Bundle::EMPTY;
            unsafe { b.push(NonNull::new(cell.as_mut_ptr() as *mut u8).unwrap()) };
            match r.push(0, b) {
                Ok(()) => {}
                Err(b) => assert_eq!(b.len(), 1),
            }
        }
        assert_eq!(r.occupancy(), (2, 2));
        assert!(r.pop(1).is_none());
        assert_eq!(r.pop(0).map(|b| b.len()), Some(1));
        assert_eq!(r.drain(0).len(), 1);
        assert_eq!(r.occupancy(), (0, 0));
    }
}
