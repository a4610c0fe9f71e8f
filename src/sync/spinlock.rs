// src/sync/spinlock.rs

//! Busy-wait mutual exclusion
//!
//! A thin layer over `spin::Mutex`. The lock is unfair and not reentrant:
//! taking it twice from the same context spins forever.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::kernel::core::{ErrorKind, KernelError, KernelResult};

/// Guard returned by [`SpinLock::lock`]
pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Spinlock with a contention counter
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
    contentions: AtomicU64,
}

impl<T> SpinLock<T> {
    /// Create an unlocked lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            contentions: AtomicU64::new(0),
        }
    }

    /// Acquire the lock, spinning while another context holds it
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        if let Some(guard) = self.inner.try_lock() {
            return guard;
        }
        self.contentions.fetch_add(1, Ordering::Relaxed);
        self.inner.lock()
    }

    /// Acquire the lock without spinning
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ResourceBusy`] if the lock is currently held.
    pub fn try_lock(&self) -> KernelResult<SpinLockGuard<'_, T>> {
        self.inner.try_lock().ok_or_else(|| {
            self.contentions.fetch_add(1, Ordering::Relaxed);
            KernelError::with_context(ErrorKind::ResourceBusy, "spinlock held")
        })
    }

    /// Whether some context currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Number of acquisitions that found the lock already held
    pub fn contentions(&self) -> u64 {
        self.contentions.load(Ordering::Relaxed)
    }

    /// Exclusive access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.inner.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}
