// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fatal conditions and the hook that reports them.
//!
//! The allocator has no recoverable error channel. Running out of memory, finding a canary
//! that does not hold the value its lifecycle demands, or being handed a pointer that resolves
//! to nothing we own all end the process through a `FatalHandler`. The handler is injected at
//! construction so that embedders can route the report through their own logging, and so that
//! tests can turn a fatal condition into an observable panic.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;

/// A condition the allocator cannot continue past.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("OutOfMemory: could not satisfy a request of {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },
    #[error("CorruptionDetected: {what} canary is {found:#x}, expected {expected:#x}")]
    CorruptionDetected {
        what: &'static str,
        expected: u32,
        found: u32,
    },
    #[error("UnrecognizedPointer: {ptr:#x} was not allocated by this allocator or was already freed")]
    UnrecognizedPointer { ptr: usize },
    #[error("AlignmentTooLarge: cannot map {size} bytes aligned to {align}")]
    AlignmentTooLarge { size: usize, align: usize },
    #[error("InvalidConfig: {0}")]
    InvalidConfig(ConfigError),
}

/// The sink for fatal conditions. Implementations must not return.
pub trait FatalHandler: Send + Sync {
    fn fatal(&self, err: &FatalError) -> !;
}

/// Prints the condition to stderr without allocating, then aborts the process.
#[derive(Default, Debug, Clone, Copy)]
pub struct AbortHandler;

impl FatalHandler for AbortHandler {
    fn fatal(&self, err: &FatalError) -> ! {
        alloc_eprintln!("binalloc: fatal: {}", err);
        unsafe { libc::abort() }
    }
}

/// Unwinds with the error's message instead of aborting.
///
/// This is meant for tests and for embedders that run the allocator as a non-global heap and
/// would rather tear down a subsystem than the whole process. Allocator state touched by the
/// failing call must be considered lost.
#[derive(Default, Debug, Clone, Copy)]
pub struct PanicHandler;

impl FatalHandler for PanicHandler {
    fn fatal(&self, err: &FatalError) -> ! {
        panic!("{}", err)
    }
}

#[derive(Clone)]
pub(crate) struct Fatal(Arc<dyn FatalHandler>);

impl Fatal {
    pub(crate) fn new(handler: Arc<dyn FatalHandler>) -> Fatal {
        Fatal(handler)
    }

    #[cold]
    #[inline(never)]
    pub(crate) fn raise(&self, err: FatalError) -> ! {
        error!("{}", err);
        self.0.fatal(&err)
    }

    #[cold]
    pub(crate) fn out_of_memory(&self, size: usize, align: usize) -> ! {
        self.raise(FatalError::OutOfMemory { size, align })
    }

    #[cold]
    pub(crate) fn unrecognized(&self, ptr: *const u8) -> ! {
        self.raise(FatalError::UnrecognizedPointer { ptr: ptr as usize })
    }

    #[cold]
    pub(crate) fn corruption(&self, what: &'static str, expected: u32, found: u32) -> ! {
        self.raise(FatalError::CorruptionDetected {
            what,
            expected,
            found,
        })
    }
}

impl fmt::Debug for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Fatal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_condition() {
        let e = FatalError::UnrecognizedPointer { ptr: 0x1000 };
        assert!(e.to_string().starts_with("UnrecognizedPointer: 0x1000"));
        let e = FatalError::CorruptionDetected {
            what: "PoolInfoSmall",
            expected: 0x17ea,
            found: 0,
        };
        assert_eq!(
            e.to_string(),
            "CorruptionDetected: PoolInfoSmall canary is 0x0, expected 0x17ea"
        );
    }

    #[test]
    #[should_panic(expected = "OutOfMemory")]
    fn panic_handler_unwinds() {
        Fatal::new(Arc::new(PanicHandler)).out_of_memory(1 << 40, 16);
    }
}
