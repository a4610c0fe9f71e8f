//! Interrupt controller abstraction.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{ArchCpu, Cpu};

/// A trait for controlling CPU interrupts.
///
/// This trait abstracts over the hardware-specific details of enabling and
/// disabling interrupts.
pub trait InterruptController {
    /// Runs `f` with interrupts masked, restoring the previous state afterwards.
    fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

/// Interrupt-enable flag of the single dispatching processor.
///
/// The flag is owned by the kernel state rather than being global so that
/// several independent kernels can coexist in one test process. Changes are
/// forwarded to the hardware through [`Cpu`].
#[derive(Debug)]
pub struct InterruptState {
    enabled: AtomicBool,
}

impl InterruptState {
    /// Interrupts start masked; the boot sequence enables them last.
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
        }
    }

    /// Check if interrupts are enabled.
    pub fn are_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable interrupts.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        ArchCpu::enable_interrupts();
    }

    /// Disable interrupts and return whether they were enabled before.
    pub fn disable(&self) -> bool {
        ArchCpu::disable_interrupts();
        self.enabled.swap(false, Ordering::AcqRel)
    }

    /// Mask interrupts until the returned guard is dropped.
    pub fn mask(&self) -> InterruptGuard<'_> {
        let was_enabled = self.disable();
        InterruptGuard {
            state: self,
            was_enabled,
        }
    }
}

impl Default for InterruptState {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for InterruptState {
    fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self.mask();
        f()
    }
}

/// Restores the interrupt state captured by [`InterruptState::mask`].
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct InterruptGuard<'a> {
    state: &'a InterruptState,
    was_enabled: bool,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.state.enable();
        }
    }
}
