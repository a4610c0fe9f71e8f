// src/panic/state.rs

//! Panic state tracking for nested panic detection
//!
//! Fatal consistency violations of the allocator and the process model enter
//! through [`super::fatal`], which records the level here before panicking.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Panic state levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PanicLevel {
    /// First panic being handled
    Primary = 1,
    /// Nested panic detected (panic during panic handling)
    Nested = 2,
    /// Critical failure (multiple nested panics)
    Critical = 3,
}

impl PanicLevel {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => None,
            1 => Some(Self::Primary),
            2 => Some(Self::Nested),
            _ => Some(Self::Critical),
        }
    }
}

/// Global panic state tracker (0 = no panic)
static PANIC_LEVEL: AtomicU8 = AtomicU8::new(0);

/// Set by [`enter_fatal`] until the panic handler picks the level up
static FATAL_PENDING: AtomicBool = AtomicBool::new(false);

/// Enter panic handling and return the resulting level
///
/// - no panic → `Primary`
/// - `Primary` → `Nested`
/// - `Nested`/`Critical` → `Critical`
pub fn enter_panic() -> PanicLevel {
    let prev = PANIC_LEVEL
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |level| {
            Some(level.saturating_add(1).min(PanicLevel::Critical as u8))
        })
        .unwrap_or(PanicLevel::Critical as u8);

    PanicLevel::from_raw(prev.saturating_add(1)).unwrap_or(PanicLevel::Critical)
}

/// Record a fatal consistency violation that is about to panic
pub fn enter_fatal() -> PanicLevel {
    let level = enter_panic();
    FATAL_PENDING.store(true, Ordering::SeqCst);
    level
}

/// Level for the panic handler
///
/// A panic raised by [`super::fatal`] was already counted, so its level is
/// reused instead of being treated as nested.
pub fn enter_from_handler() -> PanicLevel {
    if FATAL_PENDING.swap(false, Ordering::SeqCst) {
        current_level().unwrap_or(PanicLevel::Primary)
    } else {
        enter_panic()
    }
}

/// Get current panic level without modifying state
/// Returns None if not panicking (level == 0)
pub fn current_level() -> Option<PanicLevel> {
    PanicLevel::from_raw(PANIC_LEVEL.load(Ordering::Acquire))
}

/// Check if currently in panic state
#[must_use = "panic state should be checked to prevent undefined behavior"]
pub fn is_panicking() -> bool {
    current_level().is_some()
}
