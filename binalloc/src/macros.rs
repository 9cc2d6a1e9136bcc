// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocation-free printing and assertion macros.
//!
//! Formatting through `std::io` may allocate, and an allocator that allocates while reporting
//! its own corruption can recurse into the very state it is complaining about. These macros
//! format straight into file descriptor 2 with `libc::write`, serialized by a spin lock.

use std::fmt::{self, Write};

#[doc(hidden)]
pub static STDERR_MTX: spin::Mutex<()> = spin::Mutex::new(());

#[doc(hidden)]
pub struct FdWriter(pub libc::c_int);

impl Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut buf = s.as_bytes();
        while !buf.is_empty() {
            let written = unsafe { libc::write(self.0, buf.as_ptr() as *const _, buf.len()) };
            if written < 1 {
                return Err(fmt::Error);
            }
            buf = &buf[written as usize..];
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn write_stderr(args: fmt::Arguments) {
    let guard = STDERR_MTX.lock();
    let _ = FdWriter(2).write_fmt(args);
    drop(guard);
}

macro_rules! alloc_eprint {
    ($($arg:tt)*) => ($crate::macros::write_stderr(format_args!($($arg)*)))
}

macro_rules! alloc_eprintln {
    () => (alloc_eprint!("\n"));
    ($fmt:expr) => (alloc_eprint!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => (alloc_eprint!(concat!($fmt, "\n"), $($arg)*));
}

// Internal invariants. These abort rather than unwind: a broken invariant inside the
// allocator leaves nothing safe to unwind into.
macro_rules! alloc_assert {
    ($pred:expr) => ({
        alloc_assert!($pred, "{}", stringify!($pred));
    });
    ($pred:expr, $fmt:expr) => ({
        alloc_assert!($pred, "{}", $fmt);
    });
    ($pred:expr, $fmt:expr, $($arg:tt)*) => ({
        if !($pred) {
            alloc_eprintln!(concat!("assertion failed: ", $fmt, " at {}:{}"), $($arg)*, file!(), line!());
            unsafe { libc::abort() }
        }
    })
}

macro_rules! alloc_debug_assert {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            alloc_assert!($($arg)*);
        }
    }
}

macro_rules! alloc_debug_assert_eq {
    ($a:expr, $b:expr) => {
        if cfg!(debug_assertions) {
            let a = $a;
            let b = $b;
            alloc_assert!(a == b, "{} (evaluated to {:?} == {:?})", stringify!($a == $b), a, b);
        }
    };
}
