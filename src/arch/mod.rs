// src/arch/mod.rs

//! Architecture-specific abstractions.
//!
//! The scheduler and the process model only ever see the two traits defined
//! here. Both architecture modules are always compiled so that their
//! register-level behaviour can be tested on any host; privileged
//! instructions are emitted only when building for bare metal.

use core::fmt;

use crate::kernel::mm::types::VirtAddr;

pub mod riscv64;
pub mod s390x;

/// Context type used by the kernel on the current target.
#[cfg(target_arch = "riscv64")]
pub type ArchContext = riscv64::RiscvContext;
/// Context type used by the kernel on the current target.
#[cfg(not(target_arch = "riscv64"))]
pub type ArchContext = s390x::S390Context;

/// CPU control used by the kernel on the current target.
#[cfg(target_arch = "riscv64")]
pub type ArchCpu = riscv64::RiscvCpu;
/// CPU control used by the kernel on the current target.
#[cfg(not(target_arch = "riscv64"))]
pub type ArchCpu = s390x::S390Cpu;

/// Trait for CPU-specific operations.
pub trait Cpu {
    /// Halt the CPU until the next interrupt.
    fn halt();

    /// Disable interrupts.
    fn disable_interrupts();

    /// Enable interrupts.
    fn enable_interrupts();

    /// Install `root` as the primary translation root.
    fn load_translation_root(root: u64);

    /// Purge the translation lookaside buffer.
    fn flush_tlb();

    /// Send a reset signal to the auxiliary processor at `address`.
    fn signal_reset(address: u16) {
        let _ = address;
    }
}

/// Saved execution state of one thread.
///
/// `Scratch` is the live save area written by the trap entry code: the
/// interrupted registers plus the slot holding the status word the trap
/// handler will return through. Dispatching a thread means copying its
/// context into that area.
pub trait ProcessorContext: Default + Clone + fmt::Debug + Send {
    /// Live register save area of the trap entry path
    type Scratch: Default + fmt::Debug + Send;

    /// Bytes left unused at the top of every new stack
    const RESERVED_FRAME_SIZE: usize;

    /// Capture the interrupted state from `scratch`.
    fn save_context(&mut self, scratch: &Self::Scratch);

    /// Load this context into `scratch` so the trap exit resumes it.
    fn restore_context(&self, scratch: &mut Self::Scratch);

    /// Set the address execution resumes at.
    fn set_program_counter(&mut self, pc: VirtAddr);

    /// Select supervisor (`true`) or problem/user state (`false`).
    ///
    /// Non-privileged contexts also run with address translation enabled.
    fn set_privilege(&mut self, privileged: bool);

    /// Set the stack pointer register.
    fn set_stack_pointer(&mut self, sp: VirtAddr);

    /// Address execution resumes at.
    fn program_counter(&self) -> VirtAddr;

    /// Current stack pointer register.
    fn stack_pointer(&self) -> VirtAddr;

    /// Whether the context runs in supervisor state.
    fn is_privileged(&self) -> bool;

    /// Whether the context runs with address translation enabled.
    fn translation_enabled(&self) -> bool;
}
