// src/sync/mod.rs

//! Synchronization primitives
//!
//! Every region and every address space carries its own [`SpinLock`]. The
//! job table is additionally protected by masking interrupts through
//! [`InterruptState`] while it is created or grown.
//!
//! # Example
//!
//! ```
//! use realcore::sync::SpinLock;
//!
//! let counter = SpinLock::new(0u32);
//! *counter.lock() += 1;
//! assert_eq!(*counter.lock(), 1);
//! ```

pub mod interrupt;
pub mod spinlock;

// Re-export commonly used types
pub use interrupt::{InterruptController, InterruptGuard, InterruptState};
pub use spinlock::{SpinLock, SpinLockGuard};
