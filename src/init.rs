// src/init.rs

//! Kernel initialization
//!
//! Boot runs in a fixed order, enforced by an atomic phase per
//! [`KernelState`]:
//!
//! 1. [`KernelState::init_memory`] - logger and real-storage regions
//! 2. [`KernelState::init_identity`] - identity and file system hook
//! 3. [`KernelState::init_address_spaces`] - address-space subsystem
//! 4. [`KernelState::init_scheduler`] - bootstrap job, task and thread
//! 5. [`KernelState::enable_interrupts`]
//!
//! Calling a step out of order fails with [`ErrorKind::InvalidSetup`]. A step
//! that fails moves the state to [`InitPhase::Failed`], after which every
//! step is refused.

use core::sync::atomic::Ordering;

use crate::arch::ProcessorContext;
use crate::kernel::core::{ErrorKind, JobId, KernelError, KernelResult};
use crate::kernel::mm::{AddressSpace, PhysAddr};
use crate::kernel::process::JobFlags;
use crate::kernel::state::{self, KernelState};

/// Initialization phases with explicit state machine
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    NotStarted = 0,
    Memory = 1,
    Identity = 2,
    AddressSpaces = 3,
    Scheduler = 4,
    Complete = 5,
    Failed = 255,
}

impl InitPhase {
    /// Check if this phase can transition to the next phase
    const fn can_transition_to(self, next: Self) -> bool {
        if matches!(next, Self::Failed) {
            return !matches!(self, Self::Failed);
        }

        matches!(self.next(), Some(expected) if (expected as u8) == (next as u8))
    }

    /// Get next phase in sequence
    const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Memory),
            Self::Memory => Some(Self::Identity),
            Self::Identity => Some(Self::AddressSpaces),
            Self::AddressSpaces => Some(Self::Scheduler),
            Self::Scheduler => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }

    /// Human-readable name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "Not Started",
            Self::Memory => "Memory",
            Self::Identity => "Identity",
            Self::AddressSpaces => "Address Spaces",
            Self::Scheduler => "Scheduler",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }
}

impl From<u8> for InitPhase {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Memory,
            2 => Self::Identity,
            3 => Self::AddressSpaces,
            4 => Self::Scheduler,
            5 => Self::Complete,
            255 => Self::Failed,
            _ => Self::NotStarted,
        }
    }
}

/// One range of real storage handed over by the boot protocol
#[derive(Debug, Clone, Copy)]
pub struct MemoryArea {
    /// Real address of the first byte
    pub base: PhysAddr,
    /// Length in bytes
    pub size: usize,
    /// Where the kernel reaches `base`
    pub mapping: *mut u8,
}

impl MemoryArea {
    /// Area the kernel reaches at its real address
    pub const fn identity(base: PhysAddr, size: usize) -> Self {
        Self {
            base,
            size,
            mapping: base.as_usize() as *mut u8,
        }
    }
}

impl<C: ProcessorContext> KernelState<C> {
    /// Current initialization phase
    pub fn phase(&self) -> InitPhase {
        InitPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Whether every boot step has completed
    pub fn is_booted(&self) -> bool {
        self.phase() == InitPhase::Complete
    }

    fn run_step<T>(
        &self,
        next: InitPhase,
        step: impl FnOnce() -> KernelResult<T>,
    ) -> KernelResult<T> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            log::error!(
                "init: cannot enter {} from {}",
                next.as_str(),
                current.as_str()
            );
            return Err(KernelError::with_context(
                ErrorKind::InvalidSetup,
                "boot step out of order",
            ));
        }

        match step() {
            Ok(value) => {
                self.phase
                    .compare_exchange(
                        current as u8,
                        next as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .map_err(|_| {
                        KernelError::with_context(ErrorKind::ResourceBusy, "boot step raced")
                    })?;
                log::info!("init: {} done", next.as_str());
                Ok(value)
            }
            Err(e) => {
                log::error!("init: {} failed: {}", next.as_str(), e);
                self.phase.store(InitPhase::Failed as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Install the logger and register the boot memory map
    ///
    /// Returns the number of regions registered.
    ///
    /// # Safety
    ///
    /// Every area must satisfy the contract of
    /// [`crate::kernel::mm::RealMemory::add_region`].
    ///
    /// # Errors
    ///
    /// - out of order: [`ErrorKind::InvalidSetup`]
    /// - no usable area: [`ErrorKind::ResourceUnavailable`]
    pub unsafe fn init_memory(&self, areas: &[MemoryArea]) -> KernelResult<usize> {
        self.run_step(InitPhase::Memory, || {
            crate::logger::init(self.config.log_level)?;
            for area in areas {
                // SAFETY: 呼び出し側が各領域の有効性を保証している
                if let Err(e) = unsafe { self.memory.add_region(area.base, area.size, area.mapping) } {
                    log::warn!("init: area {} ({} bytes) skipped: {}", area.base, area.size, e);
                }
            }
            match self.memory.region_count() {
                0 => Err(KernelError::with_context(
                    ErrorKind::ResourceUnavailable,
                    "no usable real storage",
                )),
                n => Ok(n),
            }
        })
    }

    /// Establish the kernel identity
    ///
    /// `hook` runs with memory available; the file system layer mounts its
    /// root from here.
    ///
    /// # Errors
    ///
    /// - out of order: [`ErrorKind::InvalidSetup`]
    /// - whatever `hook` returns
    pub fn init_identity(&self, hook: impl FnOnce(&Self) -> KernelResult<()>) -> KernelResult<()> {
        self.run_step(InitPhase::Identity, || {
            log::info!(
                "init: boot user {}, bootstrap job {}",
                self.config.boot_user,
                self.config.bootstrap_job
            );
            hook(self)
        })
    }

    /// Bring up the address-space subsystem
    ///
    /// Builds and tears down one address space to prove the table
    /// geometry fits the registered storage.
    ///
    /// # Errors
    ///
    /// - out of order: [`ErrorKind::InvalidSetup`]
    /// - storage too small for a segment table: [`ErrorKind::Allocation`]
    pub fn init_address_spaces(&self) -> KernelResult<()> {
        self.run_step(InitPhase::AddressSpaces, || {
            let probe = AddressSpace::create(&self.memory)?;
            log::debug!("init: probe translation root {:#x}", probe.translation_root());
            probe.destroy(&self.memory);
            Ok(())
        })
    }

    /// Create the bootstrap job and dispatch it
    ///
    /// The bootstrap thread has no stack of its own; it keeps running on the
    /// boot stack.
    ///
    /// # Errors
    ///
    /// - out of order: [`ErrorKind::InvalidSetup`]
    /// - job, task or thread creation failed
    pub fn init_scheduler(&self) -> KernelResult<JobId> {
        self.run_step(InitPhase::Scheduler, || {
            let job = self.create_job(self.config.bootstrap_job, 0, JobFlags::WIDE, 0)?;
            let task = self.create_task(job, self.config.bootstrap_task)?;
            self.create_thread(job, task, 0)?;
            self.wake_job(job)?;
            self.schedule()?;
            Ok(job)
        })
    }

    /// Unmask interrupts; the final boot step
    ///
    /// # Errors
    ///
    /// - out of order: [`ErrorKind::InvalidSetup`]
    pub fn enable_interrupts(&self) -> KernelResult<()> {
        self.run_step(InitPhase::Complete, || {
            self.interrupts.enable();
            Ok(())
        })
    }

    /// Run every boot step in order
    ///
    /// # Safety
    ///
    /// Same as [`KernelState::init_memory`].
    ///
    /// # Errors
    ///
    /// The first failing step's error.
    pub unsafe fn boot(
        &self,
        areas: &[MemoryArea],
        identity: impl FnOnce(&Self) -> KernelResult<()>,
    ) -> KernelResult<JobId> {
        // SAFETY: 呼び出し側の保証をそのまま引き継ぐ
        unsafe { self.init_memory(areas) }?;
        self.init_identity(identity)?;
        self.init_address_spaces()?;
        let job = self.init_scheduler()?;
        self.enable_interrupts()?;
        Ok(job)
    }
}

/// Get a human-readable status string for the installed kernel's phase
pub fn status_string() -> &'static str {
    state::try_kernel().map_or(InitPhase::NotStarted.as_str(), |k| k.phase().as_str())
}
