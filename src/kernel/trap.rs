//! Trap entry
//!
//! The low-level interrupt stubs save the interrupted registers into the
//! scratch area and call [`KernelState::handle_trap`], which decides what
//! runs when the stub returns.

use crate::arch::ProcessorContext;
use crate::kernel::core::KernelResult;
use crate::kernel::process::Dispatched;
use crate::kernel::state::KernelState;

/// Reason the processor entered the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Interval timer expired
    Timer,
    /// The running thread gave up the processor
    Yield,
    /// External or I/O interrupt
    External,
    /// The running thread faulted
    ProgramCheck,
}

impl<C: ProcessorContext> KernelState<C> {
    /// Handle a trap and pick the thread to resume
    ///
    /// A program check tears down the task of the faulting thread before
    /// scheduling; the rest of its job keeps running.
    ///
    /// # Errors
    ///
    /// Whatever [`KernelState::schedule`] returns.
    pub fn handle_trap(&self, trap: Trap) -> KernelResult<Dispatched> {
        match trap {
            Trap::Timer => self.cpu.lock().tick(),
            Trap::Yield | Trap::External => {}
            Trap::ProgramCheck => {
                let faulting = self.jobs.lock().current();
                match faulting {
                    Some(cursor) => {
                        log::warn!(
                            "program check in {} task {}; removing task",
                            cursor.job,
                            cursor.task.get()
                        );
                        match self.remove_task(cursor.job, cursor.task) {
                            Err(e) if e.is_fatal() => log::error!("program check: {}", e),
                            Err(e) => log::warn!("program check: {}", e),
                            Ok(()) => {}
                        }
                    }
                    None => log::warn!("program check with nothing dispatched"),
                }
            }
        }
        self.schedule()
    }
}
