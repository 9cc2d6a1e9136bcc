// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ptr::write_volatile;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time;

use binalloc::BinnedAllocator;

const OBJECT_SIZE: usize = 16;

trait AllocLike
where
    Self: Clone + Send,
{
    fn create() -> Self;
    unsafe fn allocate(&mut self, size: usize) -> *mut u8;
    unsafe fn deallocate(&mut self, ptr: *mut u8);
    fn kill(&mut self) {}
}

#[derive(Clone)]
struct Binned(BinnedAllocator);

impl AllocLike for Binned {
    fn create() -> Self {
        Binned(BinnedAllocator::new())
    }

    unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        self.0.malloc(size, 16)
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8) {
        self.0.free(ptr)
    }

    fn kill(&mut self) {
        self.0.trim(true);
        let mut out = String::new();
        if self.0.dump_allocator_stats(&mut out).is_ok() {
            print!("{}", out);
        }
    }
}

#[derive(Clone)]
struct SystemMalloc;

impl AllocLike for SystemMalloc {
    fn create() -> Self {
        SystemMalloc
    }

    unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        libc::malloc(size) as *mut u8
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8) {
        libc::free(ptr as *mut libc::c_void)
    }
}

macro_rules! time_block {
    ($block:expr) => {{
        // warm up
        $block;
        let start = time::Instant::now();
        $block;
        let dur = start.elapsed();
        (dur.as_secs() * 1_000_000_000) + u64::from(dur.subsec_nanos())
    }};
}

macro_rules! time_block_once {
    ($block:expr) => {{
        let start = time::Instant::now();
        $block;
        let dur = start.elapsed();
        (dur.as_secs() * 1_000_000_000) + u64::from(dur.subsec_nanos())
    }};
}

fn run_threads<A, F>(nthreads: usize, mut a: A, f: F) -> u64
where
    A: AllocLike + 'static,
    F: Fn(usize, A) -> u64 + Send + Sync + 'static,
{
    let b = Arc::new(Barrier::new(nthreads + 1));
    let f = Arc::new(f);
    let mut threads = Vec::new();
    for t in 0..nthreads {
        let alloc = a.clone();
        let barrier = b.clone();
        let f = f.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("bench-{}", t))
                .spawn(move || {
                    barrier.wait();
                    f(t, alloc)
                })
                .unwrap(),
        );
    }
    b.wait();
    let total = threads.into_iter().map(|t| t.join().unwrap()).sum();
    a.kill();
    total
}

fn report(nthreads: usize, ops: usize, total: u64) {
    // total is nthreads * mean time, hence the extra nthreads factor
    println!(
        "{:.2} Mops/s",
        ((nthreads * nthreads * ops * 1_000) as f64) / (total as f64)
    );
}

fn bench_alloc_free_pairs<A: AllocLike + 'static>(nthreads: usize, per_thread: usize) {
    let total = run_threads(nthreads, A::create(), move |_, mut alloc| {
        time_block!(unsafe {
            for i in 0..per_thread {
                let ptr = alloc.allocate(OBJECT_SIZE);
                write_volatile(ptr as *mut usize, i);
                alloc.deallocate(ptr);
            }
        })
    });
    report(nthreads, per_thread * 2, total);
}

fn bench_alloc_free_pairs_buffered<A: AllocLike + 'static>(nthreads: usize, per_thread: usize) {
    let total = run_threads(nthreads, A::create(), move |_, mut alloc| {
        let mut ptrs: Vec<*mut u8> = (0..(64 * 1024))
            .map(|_| unsafe { alloc.allocate(OBJECT_SIZE) })
            .collect();
        let t = time_block!(unsafe {
            for i in 0..per_thread {
                let idx = i % ptrs.len();
                let ptr = ptrs.get_unchecked_mut(idx);
                alloc.deallocate(*ptr);
                *ptr = alloc.allocate(OBJECT_SIZE);
                write_volatile(*ptr, i as u8);
            }
        });
        for ptr in ptrs {
            unsafe { alloc.deallocate(ptr) };
        }
        t
    });
    report(nthreads, per_thread * 2, total);
}

fn bench_mixed_sizes<A: AllocLike + 'static>(nthreads: usize, per_thread: usize) {
    let total = run_threads(nthreads, A::create(), move |t, mut alloc| {
        // xorshift; the generator must not allocate
        let mut state = (t as u64 + 1) * 0x9e37_79b9_7f4a_7c15;
        let mut ptrs = vec![std::ptr::null_mut::<u8>(); 4096];
        let t = time_block_once!(unsafe {
            for i in 0..per_thread {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let size = 1 + (state as usize % 8192);
                let slot = &mut ptrs[i % 4096];
                alloc.deallocate(*slot);
                *slot = alloc.allocate(size);
                write_volatile(*slot, i as u8);
            }
        });
        for ptr in ptrs {
            unsafe { alloc.deallocate(ptr) };
        }
        t
    });
    report(nthreads, per_thread * 2, total);
}

fn bench_prod_cons<A: AllocLike + 'static>(nthreads: usize, per_thread: usize) {
    let handoff: Arc<Vec<Vec<AtomicUsize>>> = Arc::new(
        (0..nthreads)
            .map(|_| (0..per_thread).map(|_| AtomicUsize::new(0)).collect())
            .collect(),
    );
    let filled = Arc::new(Barrier::new(nthreads));
    let total = run_threads(nthreads, A::create(), move |t, mut alloc| {
        let (me, them) = (t, (t + 1) % nthreads);
        for (i, slot) in handoff[me].iter().enumerate() {
            let ptr = unsafe { alloc.allocate(OBJECT_SIZE) };
            unsafe { write_volatile(ptr as *mut usize, i) };
            slot.store(ptr as usize, Ordering::Release);
        }
        filled.wait();
        time_block_once!(unsafe {
            for slot in handoff[them].iter() {
                alloc.deallocate(slot.load(Ordering::Acquire) as *mut u8);
            }
        })
    });
    report(nthreads, per_thread, total);
}

macro_rules! run_bench_inner {
    ($bench:tt, $nthreads:expr, $iters:expr) => {
        println!("binned allocator");
        $bench::<Binned>($nthreads, $iters);
        println!("system malloc");
        $bench::<SystemMalloc>($nthreads, $iters);
    };
}

macro_rules! run_bench {
    (both $desc:expr, $bench:tt, $nthreads:expr, $iters:expr) => {
        println!("\n{} - {}", $desc, "single-threaded");
        run_bench_inner!($bench, 1, $iters);
        println!("\n{} - {} threads", $desc, $nthreads);
        run_bench_inner!($bench, $nthreads, $iters);
    };

    (threads $desc:expr, $bench:tt, $nthreads:expr, $iters:expr) => {
        println!("\n{} - {} threads", $desc, $nthreads);
        run_bench_inner!($bench, $nthreads, $iters);
    };
}

fn main() {
    const ITERS: usize = 1_000_000;
    let nthreads = num_cpus::get();
    println!(
        "allocating {} bytes per thread",
        ITERS * OBJECT_SIZE
    );

    run_bench!(both "alloc/free pairs", bench_alloc_free_pairs, nthreads, ITERS);
    run_bench!(both "buffered alloc/free pairs", bench_alloc_free_pairs_buffered, nthreads, ITERS);
    run_bench!(both "mixed sizes", bench_mixed_sizes, nthreads, ITERS);
    run_bench!(threads "free (producer-consumer)", bench_prod_cons, nthreads, ITERS / 10);
}
