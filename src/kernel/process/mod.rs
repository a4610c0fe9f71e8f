// src/kernel/process/mod.rs
//! Job / Task / Thread management
//!
//! A job owns an optional address space, a symbol table and an ordered list
//! of tasks. A task owns an ordered list of threads, and a thread owns its
//! processor context and (usually) a stack taken from real storage.
//!
//! The types here are plain data plus the operations that only touch one
//! job. Operations that need the job table or the scheduler cursor live in
//! [`lifecycle`] as methods of [`crate::kernel::state::KernelState`].

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arch::{ArchContext, ProcessorContext};
use crate::config::PAGE_SIZE;
use crate::kernel::core::{
    JobId, KernelResult, MemoryError, ObjectName, TaskError, TaskId, ThreadId, UserId,
};
use crate::kernel::mm::{AddressSpace, PhysAddr, RealMemory, VirtAddr};

pub mod lifecycle;
pub mod switch;
pub mod symbols;
pub mod table;

pub use switch::{CpuState, Dispatched};
pub use symbols::{Symbol, SymbolTable};
pub use table::JobTable;

bitflags! {
    /// Job attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JobFlags: u32 {
        /// Runs in its own address space
        const VIRTUAL = 1 << 0;
        /// 64-bit word width (otherwise 31-bit)
        const WIDE = 1 << 1;
        /// Not eligible for dispatch
        const SLEEP = 1 << 2;
    }
}

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Waiting to be dispatched
    Ready,
    /// Currently dispatched
    Running,
    /// Skipped by the scheduler until woken
    Blocked,
}

/// Stack taken from real storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stack {
    base: PhysAddr,
    size: usize,
}

impl Stack {
    /// Lowest address of the stack
    #[must_use]
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// Size in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// One past the highest address of the stack
    #[must_use]
    pub const fn top(&self) -> PhysAddr {
        PhysAddr::new(self.base.as_usize() + self.size)
    }
}

/// Thread control block
#[derive(Debug)]
pub struct Thread<C: ProcessorContext = ArchContext> {
    id: ThreadId,
    stack: Option<Stack>,
    context: C,
    status: ThreadStatus,
}

impl<C: ProcessorContext> Thread<C> {
    pub(crate) fn new(id: ThreadId, stack: Option<Stack>) -> Self {
        let mut context = C::default();
        if let Some(stack) = stack {
            let sp = stack.top().as_usize() - C::RESERVED_FRAME_SIZE;
            context.set_stack_pointer(VirtAddr::new(sp));
        }
        Self {
            id,
            stack,
            context,
            status: ThreadStatus::Ready,
        }
    }

    /// Thread ID
    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    /// Owned stack; `None` for kernel-managed threads
    #[must_use]
    pub const fn stack(&self) -> Option<Stack> {
        self.stack
    }

    /// Saved processor context
    #[must_use]
    pub const fn context(&self) -> &C {
        &self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> ThreadStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ThreadStatus) {
        self.status = status;
    }

    /// Whether the scheduler may pick this thread
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.status != ThreadStatus::Blocked
    }

    /// Set the resume address and privilege
    ///
    /// Non-privileged threads run in problem state with address translation
    /// on; privileged threads run in supervisor state.
    pub fn set_pc(&mut self, pc: VirtAddr, privileged: bool) {
        self.context.set_program_counter(pc);
        self.context.set_privilege(privileged);
    }
}

/// Per-task usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Times one of the task's threads was dispatched
    pub dispatches: u64,
    /// Timer tick of the last dispatch
    pub last_dispatch: u64,
}

/// Task control block
#[derive(Debug)]
pub struct Task<C: ProcessorContext = ArchContext> {
    id: TaskId,
    name: ObjectName,
    threads: Vec<Thread<C>>,
    current_thread: usize,
    stats: TaskStats,
}

impl<C: ProcessorContext> Task<C> {
    pub(crate) fn new(id: TaskId, name: ObjectName) -> Self {
        Self {
            id,
            name,
            threads: Vec::new(),
            current_thread: 0,
            stats: TaskStats::default(),
        }
    }

    /// Task ID
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Task name
    #[must_use]
    pub const fn name(&self) -> ObjectName {
        self.name
    }

    /// Threads in dispatch order
    #[must_use]
    pub fn threads(&self) -> &[Thread<C>] {
        &self.threads
    }

    pub(crate) fn threads_mut(&mut self) -> &mut [Thread<C>] {
        &mut self.threads
    }

    /// Index of the last dispatched thread
    #[must_use]
    pub const fn current_thread(&self) -> usize {
        self.current_thread
    }

    pub(crate) fn set_current_thread(&mut self, index: usize) {
        self.current_thread = index;
    }

    /// Usage statistics
    #[must_use]
    pub const fn stats(&self) -> TaskStats {
        self.stats
    }

    pub(crate) fn record_dispatch(&mut self, tick: u64) {
        self.stats.dispatches += 1;
        self.stats.last_dispatch = tick;
    }

    /// Look up a thread
    pub fn thread(&self, id: ThreadId) -> Option<&Thread<C>> {
        self.threads.iter().find(|t| t.id == id)
    }

    /// Look up a thread for modification
    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread<C>> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    pub(crate) fn push_thread(&mut self, thread: Thread<C>) {
        self.threads.push(thread);
    }

    /// Detach a thread from the task
    ///
    /// `current_thread` is kept on the same thread when possible and reset to
    /// 0 when it falls off the end.
    pub(crate) fn take_thread(&mut self, id: ThreadId) -> KernelResult<Thread<C>> {
        let index = self
            .threads
            .iter()
            .position(|t| t.id == id)
            .ok_or(TaskError::ThreadNotFound)?;
        let thread = self.threads.remove(index);

        if index < self.current_thread {
            self.current_thread -= 1;
        }
        if self.current_thread >= self.threads.len() {
            self.current_thread = 0;
        }
        Ok(thread)
    }
}

/// Unmap and free a thread stack. Returns the bytes released.
fn release_stack(mem: &RealMemory, space: Option<&AddressSpace>, stack: Option<Stack>) -> usize {
    let Some(stack) = stack else {
        return 0;
    };
    if let Some(space) = space {
        let mut page = stack.base.align_down(PAGE_SIZE).as_usize();
        while page < stack.top().as_usize() {
            // マップ途中で失敗したスタックは一部しかマップされていない
            let _ = space.unmap_page(mem, VirtAddr::new(page));
            page += PAGE_SIZE;
        }
    }
    mem.free(stack.base);
    stack.size
}

/// Job control block
#[derive(Debug)]
pub struct Job<C: ProcessorContext = ArchContext> {
    id: JobId,
    name: ObjectName,
    flags: JobFlags,
    priority: i8,
    max_mem: usize,
    mem_used: usize,
    owner: UserId,
    tasks: Vec<Task<C>>,
    current_task: usize,
    symbols: SymbolTable,
    address_space: Option<AddressSpace>,
}

impl<C: ProcessorContext> Job<C> {
    pub(crate) fn new(
        id: JobId,
        name: ObjectName,
        priority: i8,
        flags: JobFlags,
        max_mem: usize,
        owner: UserId,
    ) -> Self {
        Self {
            id,
            name,
            flags,
            priority,
            max_mem,
            mem_used: 0,
            owner,
            tasks: Vec::new(),
            current_task: 0,
            symbols: SymbolTable::new(),
            address_space: None,
        }
    }

    /// Job handle
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Job name
    #[must_use]
    pub const fn name(&self) -> ObjectName {
        self.name
    }

    /// Attribute flags
    #[must_use]
    pub const fn flags(&self) -> JobFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: JobFlags) {
        self.flags = flags;
    }

    /// Recorded priority (not honoured by the scheduler)
    #[must_use]
    pub const fn priority(&self) -> i8 {
        self.priority
    }

    /// Owner user
    #[must_use]
    pub const fn owner(&self) -> UserId {
        self.owner
    }

    /// Memory limit in bytes; 0 means unlimited
    #[must_use]
    pub const fn max_mem(&self) -> usize {
        self.max_mem
    }

    /// Bytes charged to the job
    #[must_use]
    pub const fn mem_used(&self) -> usize {
        self.mem_used
    }

    /// Whether the job is asleep
    #[must_use]
    pub const fn is_asleep(&self) -> bool {
        self.flags.contains(JobFlags::SLEEP)
    }

    /// Whether the job has at least one task that could be dispatched
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        !self.is_asleep() && !self.tasks.is_empty()
    }

    /// Tasks in dispatch order
    #[must_use]
    pub fn tasks(&self) -> &[Task<C>] {
        &self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [Task<C>] {
        &mut self.tasks
    }

    /// Index of the last dispatched task
    #[must_use]
    pub const fn current_task(&self) -> usize {
        self.current_task
    }

    pub(crate) fn set_current_task(&mut self, index: usize) {
        self.current_task = index;
    }

    /// Look up a task
    pub fn task(&self, id: TaskId) -> Option<&Task<C>> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Look up a task for modification
    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task<C>> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Symbols registered by the loader
    #[must_use]
    pub const fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Symbols for modification
    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    /// Address space of a virtual job
    #[must_use]
    pub const fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }

    pub(crate) fn set_address_space(&mut self, space: AddressSpace) {
        self.address_space = Some(space);
    }

    pub(crate) fn push_task(&mut self, task: Task<C>) {
        self.tasks.push(task);
    }

    /// Charge `bytes` against the memory limit
    ///
    /// # Errors
    ///
    /// [`MemoryError::QuotaExceeded`] if the limit would be exceeded
    pub fn charge(&mut self, bytes: usize) -> KernelResult<()> {
        let used = self
            .mem_used
            .checked_add(bytes)
            .ok_or(MemoryError::QuotaExceeded)?;
        if self.max_mem != 0 && used > self.max_mem {
            return Err(MemoryError::QuotaExceeded.into());
        }
        self.mem_used = used;
        Ok(())
    }

    /// Return `bytes` previously charged
    pub fn uncharge(&mut self, bytes: usize) {
        self.mem_used = self.mem_used.saturating_sub(bytes);
    }

    /// Remove a task, releasing its threads' stacks
    ///
    /// `current_task` is kept on the same task when possible and reset to 0
    /// when it falls off the end.
    ///
    /// # Errors
    ///
    /// [`TaskError::TaskNotFound`] if the job has no such task
    pub fn remove_task(&mut self, mem: &RealMemory, id: TaskId) -> KernelResult<()> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or(TaskError::TaskNotFound)?;
        let task = self.tasks.remove(index);

        if index < self.current_task {
            self.current_task -= 1;
        }
        if self.current_task >= self.tasks.len() {
            self.current_task = 0;
        }

        let space = self.address_space.as_ref();
        let released: usize = task
            .threads
            .into_iter()
            .map(|t| release_stack(mem, space, t.stack))
            .sum();
        self.uncharge(released);
        log::info!("job {}: task {} removed", self.name, id.get());
        Ok(())
    }

    /// Remove a thread from one of the job's tasks
    ///
    /// # Errors
    ///
    /// [`TaskError::TaskNotFound`] or [`TaskError::ThreadNotFound`]
    pub fn remove_thread(
        &mut self,
        mem: &RealMemory,
        task: TaskId,
        thread: ThreadId,
    ) -> KernelResult<()> {
        let removed = self
            .task_mut(task)
            .ok_or(TaskError::TaskNotFound)?
            .take_thread(thread)?;
        let released = release_stack(mem, self.address_space.as_ref(), removed.stack);
        self.uncharge(released);
        Ok(())
    }

    /// Release every resource the job owns
    pub(crate) fn release(self, mem: &RealMemory) {
        for task in self.tasks {
            for thread in task.threads {
                // アドレス空間ごと破棄するのでアンマップは不要
                release_stack(mem, None, thread.stack);
            }
        }
        if let Some(space) = self.address_space {
            space.destroy(mem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::s390x::S390Context;
    use crate::kernel::core::ErrorKind;

    fn job(max_mem: usize) -> Job<S390Context> {
        Job::new(
            JobId::new(0, 0),
            ObjectName::new("JOB1").unwrap(),
            1,
            JobFlags::SLEEP,
            max_mem,
            UserId::ROOT,
        )
    }

    #[test]
    fn charge_respects_limit() {
        let mut j = job(10_000);
        j.charge(8192).unwrap();
        let err = j.charge(4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert_eq!(j.mem_used(), 8192);
        j.uncharge(8192);
        assert_eq!(j.mem_used(), 0);

        let mut unlimited = job(0);
        unlimited.charge(1 << 30).unwrap();
    }

    #[test]
    fn new_job_is_not_dispatchable() {
        let mut j = job(0);
        assert!(!j.is_dispatchable());
        j.push_task(Task::new(TaskId(1), ObjectName::new("T").unwrap()));
        assert!(!j.is_dispatchable());
        j.set_flags(JobFlags::empty());
        assert!(j.is_dispatchable());
    }

    #[test]
    fn removing_current_last_task_resets_cursor() {
        let mem = RealMemory::new();
        let mut j = job(0);
        j.push_task(Task::new(TaskId(1), ObjectName::new("A").unwrap()));
        j.push_task(Task::new(TaskId(2), ObjectName::new("B").unwrap()));
        j.set_current_task(1);
        j.remove_task(&mem, TaskId(2)).unwrap();
        assert_eq!(j.current_task(), 0);
        j.remove_task(&mem, TaskId(1)).unwrap();
        assert_eq!(j.current_task(), 0);
        assert_eq!(
            j.remove_task(&mem, TaskId(1)).unwrap_err().kind(),
            ErrorKind::ResourceExpected
        );
    }

    #[test]
    fn removing_earlier_thread_keeps_cursor_on_same_thread() {
        let mut task: Task<S390Context> = Task::new(TaskId(1), ObjectName::new("A").unwrap());
        for id in 1..=3 {
            task.push_thread(Thread::new(ThreadId(id), None));
        }
        task.set_current_thread(2);
        task.take_thread(ThreadId(1)).unwrap();
        assert_eq!(task.current_thread(), 1);
        assert_eq!(task.threads()[1].id(), ThreadId(3));
    }

    #[test]
    fn stack_pointer_leaves_reserved_frame() {
        let stack = Stack {
            base: PhysAddr::new(0x4000),
            size: 8192,
        };
        let thread: Thread<S390Context> = Thread::new(ThreadId(1), Some(stack));
        assert_eq!(
            thread.context().stack_pointer().as_usize(),
            0x4000 + 8192 - S390Context::RESERVED_FRAME_SIZE
        );
    }
}
