//! Context switching
//!
//! The trap entry code leaves the interrupted registers in the scratch area
//! of [`CpuState`]. Switching threads means saving that area into the
//! outgoing thread's context and loading the incoming thread's context back
//! into it, so the trap exit resumes the new thread.

use crate::arch::{ArchContext, ArchCpu, Cpu, ProcessorContext};
use crate::kernel::core::{JobId, TaskId, ThreadId};
use crate::kernel::process::table::{Cursor, JobTable};
use crate::kernel::process::ThreadStatus;

/// Per-processor dispatch state
#[derive(Debug, Default)]
pub struct CpuState<C: ProcessorContext = ArchContext> {
    scratch: C::Scratch,
    translation_root: Option<u64>,
    tlb_flushes: u64,
    ticks: u64,
    switches: u64,
}

impl<C: ProcessorContext> CpuState<C> {
    /// Live register save area
    #[must_use]
    pub const fn scratch(&self) -> &C::Scratch {
        &self.scratch
    }

    /// Live register save area, as written by the trap entry path
    pub fn scratch_mut(&mut self) -> &mut C::Scratch {
        &mut self.scratch
    }

    /// Translation root currently loaded, if any
    #[must_use]
    pub const fn translation_root(&self) -> Option<u64> {
        self.translation_root
    }

    /// Number of TLB purges issued
    #[must_use]
    pub const fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes
    }

    /// Timer ticks seen
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of dispatches performed
    #[must_use]
    pub const fn switches(&self) -> u64 {
        self.switches
    }

    pub(crate) fn tick(&mut self) {
        self.ticks += 1;
    }

    fn load_translation_root(&mut self, root: u64) {
        ArchCpu::load_translation_root(root);
        ArchCpu::flush_tlb();
        self.translation_root = Some(root);
        self.tlb_flushes += 1;
    }
}

/// Result of one scheduling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    /// Job now running
    pub job: JobId,
    /// Task now running
    pub task: TaskId,
    /// Thread now running
    pub thread: ThreadId,
    /// Whether a different thread was running before
    pub switched: bool,
}

/// Slot position of a thread inside the job table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// Job slot index
    pub job: usize,
    /// Task index inside the job
    pub task: usize,
    /// Thread index inside the task
    pub thread: usize,
}

/// Switch the processor to the thread at `to`
///
/// The outgoing thread (if it still exists) gets the scratch area saved into
/// its context and goes back to `Ready`. The incoming thread is loaded into
/// the scratch area, marked `Running`, and the job and task cursors are moved
/// onto it. The cursors it leaves behind are reset to 0. When the incoming
/// job has its own address space its translation root is loaded and the TLB
/// purged.
///
/// Returns `None` if `to` does not name a thread.
pub(crate) fn dispatch<C: ProcessorContext>(
    table: &mut JobTable<C>,
    cpu: &mut CpuState<C>,
    to: Position,
) -> Option<Dispatched> {
    let previous = table.current();
    table.get_by_index(to.job)?;

    if let Some(prev) = previous {
        if let Some(job) = table.get_mut(prev.job) {
            // 次にこのジョブ・タスクへ戻るときは先頭から
            job.set_current_task(0);
            if let Some(task) = job.task_mut(prev.task) {
                task.set_current_thread(0);
                if let Some(thread) = task.thread_mut(prev.thread) {
                    thread.context_mut().save_context(&cpu.scratch);
                    if thread.status() == ThreadStatus::Running {
                        thread.set_status(ThreadStatus::Ready);
                    }
                }
            }
        }
    }

    let tick = cpu.ticks;
    let job = table.get_by_index_mut(to.job)?;
    let job_id = job.id();
    let root = job.address_space().map(|space| space.translation_root());

    job.set_current_task(to.task);
    let task = job.tasks_mut().get_mut(to.task)?;
    let task_id = task.id();
    task.set_current_thread(to.thread);
    task.record_dispatch(tick);

    let thread = task.threads_mut().get_mut(to.thread)?;
    let thread_id = thread.id();
    thread.set_status(ThreadStatus::Running);
    thread.context().restore_context(&mut cpu.scratch);

    if let Some(root) = root {
        cpu.load_translation_root(root);
    }
    cpu.switches += 1;

    let cursor = Cursor {
        job: job_id,
        task: task_id,
        thread: thread_id,
    };
    table.set_current(Some(cursor));

    let switched = previous != Some(cursor);
    if switched {
        log::trace!(
            "dispatch {} task {} thread {}",
            job_id,
            task_id.get(),
            thread_id.get()
        );
    }

    Some(Dispatched {
        job: job_id,
        task: task_id,
        thread: thread_id,
        switched,
    })
}
