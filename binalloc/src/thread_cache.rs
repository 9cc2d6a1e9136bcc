// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread caches of free small blocks.
//!
//! Each thread keeps, per allocator, one `ThreadCache`: a `FreeBlockList` for every size class
//! plus a running count of the small bytes the thread has allocated minus those it has freed.
//! Caches live in a thread-local vector keyed by allocator id, so one thread can use any number
//! of allocators. The allocator keeps weak references to every cache it created so that `trim`
//! can flush caches of other threads; the per-cache spin lock is uncontended except while that
//! happens.
//!
//! When a thread exits its caches are dropped, which returns every cached block to its slab and
//! folds the thread's byte count into the allocator's consolidated counter. A cache whose
//! allocator is already gone is discarded without touching its blocks: the memory they lived
//! in has been released.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::binned::Inner;
use crate::bundle::FreeBlockList;

pub(crate) struct ThreadCache {
    owner: Weak<Inner>,
    lists: Mutex<Box<[FreeBlockList]>>,
    allocated_bytes: AtomicI64,
}

impl ThreadCache {
    fn new(inner: &Arc<Inner>) -> ThreadCache {
        let config = inner.config();
        let lists: Vec<FreeBlockList> = inner
            .classes()
            .iter()
            .map(|c| {
                FreeBlockList::new(
                    c.block_size as usize,
                    config.bundle_max_count,
                    config.bundle_max_bytes,
                )
            })
            .collect();
        ThreadCache {
            owner: Arc::downgrade(inner),
            lists: Mutex::new(lists.into_boxed_slice()),
            allocated_bytes: AtomicI64::new(0),
        }
    }

    pub(crate) fn alloc(&self, inner: &Inner, pool: usize) -> NonNull<u8> {
        let mut lists = self.lists.lock();
        let list = &mut lists[pool];
        let block = if let Some(block) = list.pop() {
            trace_event!(cache_alloc);
            block
        } else if let Some(bundle) = inner.recycler().pop(pool) {
            trace_event!(recycler_alloc);
            list.refill(bundle);
            match list.pop() {
                Some(block) => block,
                None => inner.alloc_from_slabs(pool, Some(list)),
            }
        } else {
            trace_event!(slab_alloc);
            inner.alloc_from_slabs(pool, Some(list))
        };
        self.allocated_bytes
            .fetch_add(inner.block_size(pool) as i64, Ordering::Relaxed);
        block
    }

    pub(crate) fn free(&self, inner: &Inner, pool: usize, block: NonNull<u8>) {
        let mut lists = self.lists.lock();
        let list = &mut lists[pool];
        if !unsafe { list.push(block) } {
            if let Some(full) = list.take_full() {
                match inner.recycler().push(pool, full) {
                    Ok(()) => trace_event!(recycler_free),
                    Err(full) => {
                        trace_event!(slab_free);
                        inner.flush_bundle(pool, full);
                    }
                }
            }
            let pushed = unsafe { list.push(block) };
            alloc_debug_assert!(pushed);
        } else {
            trace_event!(cache_free);
        }
        self.allocated_bytes
            .fetch_sub(inner.block_size(pool) as i64, Ordering::Relaxed);
    }

    /// Return every cached block to its slab.
    pub(crate) fn flush(&self, inner: &Inner) {
        let mut lists = self.lists.lock();
        for (pool, list) in lists.iter_mut().enumerate() {
            if list.len() == 0 {
                continue;
            }
            let (partial, full) = list.take_all();
            alloc_debug_assert_eq!(list.len(), 0);
            inner.flush_bundle(pool, partial);
            inner.flush_bundle(pool, full);
        }
    }

    pub(crate) fn allocated_bytes(&self) -> i64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn cached_blocks(&self) -> u64 {
        self.lists.lock().iter().map(|l| u64::from(l.len())).sum()
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            self.flush(&inner);
            let bytes = self.allocated_bytes.swap(0, Ordering::Relaxed);
            inner.consolidate(bytes);
            debug!("thread cache retired with {} outstanding bytes", bytes);
        }
    }
}

struct LocalCache {
    allocator_id: usize,
    owner: Weak<Inner>,
    // None: caching disabled on this thread
    cache: Option<Arc<ThreadCache>>,
}

thread_local! {
    static LOCAL_CACHES: RefCell<Vec<LocalCache>> = RefCell::new(Vec::new());
}

fn new_entry(caches: &mut Vec<LocalCache>, inner: &Arc<Inner>, cache: Option<Arc<ThreadCache>>) {
    // Entries of dropped allocators are dead weight; their caches discard themselves.
    caches.retain(|c| c.owner.strong_count() > 0);
    caches.push(LocalCache {
        allocator_id: inner.id(),
        owner: Arc::downgrade(inner),
        cache,
    });
}

fn create(inner: &Arc<Inner>) -> Arc<ThreadCache> {
    let cache = Arc::new(ThreadCache::new(inner));
    inner.register(&cache);
    cache
}

fn position(caches: &[LocalCache], inner: &Inner) -> Option<usize> {
    let id = inner.id();
    caches.iter().position(|c| c.allocator_id == id)
}

/// Run `f` with the calling thread's cache for `inner`. A cache is created on first use if
/// `create_missing` is set and caching has not been disabled on this thread. `f` receives `None` if
/// there is no cache, or if thread-local storage is unavailable because the thread is exiting.
pub(crate) fn with_cache<R, F>(inner: &Arc<Inner>, create_missing: bool, mut f: F) -> R
where
    F: FnMut(Option<&ThreadCache>) -> R,
{
    let res = LOCAL_CACHES.try_with(|caches| {
        let mut caches = caches.try_borrow_mut().ok()?;
        let pos = match position(&caches, inner) {
            Some(pos) => pos,
            None if create_missing => {
                let cache = create(inner);
                new_entry(&mut caches, inner, Some(cache));
                caches.len() - 1
            }
            None => return None,
        };
        let cache = caches[pos].cache.as_deref()?;
        Some(f(Some(cache)))
    });
    match res {
        Ok(Some(r)) => r,
        _ => f(None),
    }
}

/// Give the calling thread a cache for `inner`, re-enabling caching if it was disabled.
pub(crate) fn setup(inner: &Arc<Inner>) {
    let _ = LOCAL_CACHES.try_with(|caches| {
        let mut caches = match caches.try_borrow_mut() {
            Ok(caches) => caches,
            Err(_) => return,
        };
        match position(&caches, inner) {
            Some(pos) => {
                if caches[pos].cache.is_none() {
                    caches[pos].cache = Some(create(inner));
                }
            }
            None => {
                let cache = create(inner);
                new_entry(&mut caches, inner, Some(cache));
            }
        }
    });
}

/// Flush and drop the calling thread's cache for `inner`, and keep it from being recreated.
pub(crate) fn clear_and_disable(inner: &Arc<Inner>) {
    let old = LOCAL_CACHES
        .try_with(|caches| {
            let mut caches = caches.try_borrow_mut().ok()?;
            match position(&caches, inner) {
                Some(pos) => caches[pos].cache.take(),
                None => {
                    new_entry(&mut caches, inner, None);
                    None
                }
            }
        })
        .ok()
        .and_then(|c| c);
    if let Some(cache) = old {
        cache.flush(inner);
        // Drop folds the byte count into the allocator.
        drop(cache);
    }
}
