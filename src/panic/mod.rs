// src/panic/mod.rs

//! Panic handling utilities
//!
//! This module provides panic state tracking, nested panic detection and the
//! [`fatal`] entry used for kernel consistency violations.

pub mod handler;
pub mod state;

// Re-export commonly used types
pub use state::{PanicLevel, current_level, enter_fatal, enter_panic, is_panicking};

/// Stop the kernel because an internal invariant no longer holds.
///
/// Used for corrupted allocator state (double free, self-linked block, block
/// sizes no longer summing to the region size). The message is logged before
/// the panic so it survives even if the panic output path is broken.
#[cold]
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    let level = enter_fatal();
    log::error!("fatal ({:?}): {}", level, msg);
    panic!("kernel consistency violation: {}", msg)
}
