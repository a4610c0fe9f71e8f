//! Job / task / thread lifecycle
//!
//! Every operation takes the job table lock for its whole duration. Memory
//! and address-space locks are only taken underneath it.

use core::sync::atomic::Ordering;

use crate::arch::ProcessorContext;
use crate::config::PAGE_SIZE;
use crate::kernel::core::prelude::*;
use crate::kernel::mm::{AddressSpace, PageFlags, VirtAddr};
use crate::kernel::process::{release_stack, Job, JobFlags, Stack, Task, Thread, ThreadStatus};
use crate::kernel::state::KernelState;
use crate::sync::InterruptController;

impl<C: ProcessorContext> KernelState<C> {
    /// Create a job
    ///
    /// The job starts asleep and without tasks; call [`KernelState::wake_job`]
    /// once it is populated. A `VIRTUAL` job gets its own address space. The
    /// owner is the owner of the current job, or the boot user before the
    /// scheduler runs.
    ///
    /// # Arguments
    /// * `name` - up to 8 bytes
    /// * `priority` - recorded only
    /// * `flags` - `SLEEP` is always added
    /// * `max_mem` - byte limit for thread stacks, 0 for unlimited
    ///
    /// # Errors
    ///
    /// - name too long: [`crate::kernel::core::ErrorKind::InvalidParam`]
    /// - address space allocation failed: [`crate::kernel::core::ErrorKind::Allocation`]
    pub fn create_job(
        &self,
        name: &str,
        priority: i8,
        flags: JobFlags,
        max_mem: usize,
    ) -> KernelResult<JobId> {
        let name = ObjectName::new(name)?;
        let owner = self
            .with_current_job(Job::owner)
            .unwrap_or(UserId(self.config.boot_user));

        let id = self.interrupts.without_interrupts(|| {
            self.jobs.lock().insert_with(|id| {
                Job::new(id, name, priority, flags | JobFlags::SLEEP, max_mem, owner)
            })
        });

        if flags.contains(JobFlags::VIRTUAL) {
            let space = match AddressSpace::create(&self.memory) {
                Ok(space) => space,
                Err(e) => {
                    self.jobs.lock().remove(id);
                    log::warn!("job {}: address space creation failed: {}", name, e);
                    return Err(e);
                }
            };
            match self.jobs.lock().get_mut(id) {
                Some(job) => job.set_address_space(space),
                None => {
                    space.destroy(&self.memory);
                    return Err(TaskError::JobNotFound.into());
                }
            }
        }

        log::info!("job {} created as {} (owner {})", name, id, owner.0);
        Ok(id)
    }

    /// Tear a job down
    ///
    /// Frees every thread stack and the address space and releases the slot.
    /// Handles to the job stop resolving.
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`] if the handle is stale
    pub fn destroy_job(&self, id: JobId) -> KernelResult<()> {
        let job = self
            .interrupts
            .without_interrupts(|| self.jobs.lock().remove(id))
            .ok_or(TaskError::JobNotFound)?;
        let name = job.name();
        job.release(&self.memory);
        log::info!("job {} ({}) destroyed", name, id);
        Ok(())
    }

    /// Make a job eligible for dispatch
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`] if the handle is stale
    pub fn wake_job(&self, id: JobId) -> KernelResult<()> {
        self.with_job_mut(id, |job| job.set_flags(job.flags() - JobFlags::SLEEP))
    }

    /// Stop dispatching a job
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`] if the handle is stale
    pub fn sleep_job(&self, id: JobId) -> KernelResult<()> {
        self.with_job_mut(id, |job| job.set_flags(job.flags() | JobFlags::SLEEP))
    }

    /// Append a task to a job
    ///
    /// # Errors
    ///
    /// - name too long: [`crate::kernel::core::ErrorKind::InvalidParam`]
    /// - stale job handle: [`TaskError::JobNotFound`]
    pub fn create_task(&self, job: JobId, name: &str) -> KernelResult<TaskId> {
        let name = ObjectName::new(name)?;
        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        self.with_job_mut(job, |j| j.push_task(Task::new(id, name)))?;
        log::debug!("{}: task {} ({}) created", job, id.get(), name);
        Ok(id)
    }

    /// Remove a task and free its threads' stacks
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`] or [`TaskError::TaskNotFound`]
    pub fn remove_task(&self, job: JobId, task: TaskId) -> KernelResult<()> {
        let mut jobs = self.jobs.lock();
        jobs.get_mut(job)
            .ok_or(TaskError::JobNotFound)?
            .remove_task(&self.memory, task)
    }

    /// Create a thread inside a task
    ///
    /// A non-zero `stack_size` allocates a zeroed, page-aligned stack,
    /// charges it to the job and points the stack pointer just below the
    /// reserved frame at its top. Virtual jobs get the stack identity-mapped.
    /// A zero `stack_size` creates a kernel-managed thread without a stack.
    ///
    /// # Errors
    ///
    /// - stale handles: [`TaskError::JobNotFound`] / [`TaskError::TaskNotFound`]
    /// - quota exceeded or out of memory: [`crate::kernel::core::ErrorKind::Allocation`]
    pub fn create_thread(
        &self,
        job: JobId,
        task: TaskId,
        stack_size: usize,
    ) -> KernelResult<ThreadId> {
        let mut jobs = self.jobs.lock();
        let j = jobs.get_mut(job).ok_or(TaskError::JobNotFound)?;
        if j.task(task).is_none() {
            return Err(TaskError::TaskNotFound.into());
        }

        let stack = if stack_size == 0 {
            None
        } else {
            Some(self.allocate_stack(j, stack_size)?)
        };

        let id = ThreadId(self.next_thread.fetch_add(1, Ordering::Relaxed));
        let thread = Thread::new(id, stack);
        if let Some(t) = j.task_mut(task) {
            t.push_thread(thread);
        }
        match stack {
            Some(s) => log::debug!(
                "{}: thread {} with stack {} (+{:#x})",
                job,
                id.get(),
                s.base(),
                s.size()
            ),
            None => log::debug!("{}: kernel thread {}", job, id.get()),
        }
        Ok(id)
    }

    fn allocate_stack(&self, job: &mut Job<C>, size: usize) -> KernelResult<Stack> {
        job.charge(size)?;
        let base = match self.memory.alloc_zeroed(size, PAGE_SIZE) {
            Ok(base) => base,
            Err(e) => {
                job.uncharge(size);
                return Err(e);
            }
        };

        if let Some(space) = job.address_space() {
            if let Err(e) = space.map_range(
                &self.memory,
                VirtAddr::identity(base),
                base,
                PageFlags::READ_WRITE,
                size,
            ) {
                release_stack(&self.memory, Some(space), Some(Stack { base, size }));
                job.uncharge(size);
                return Err(e);
            }
        }

        Ok(Stack { base, size })
    }

    /// Remove a thread and free its stack
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`], [`TaskError::TaskNotFound`] or
    /// [`TaskError::ThreadNotFound`]
    pub fn remove_thread(&self, job: JobId, task: TaskId, thread: ThreadId) -> KernelResult<()> {
        let mut jobs = self.jobs.lock();
        jobs.get_mut(job)
            .ok_or(TaskError::JobNotFound)?
            .remove_thread(&self.memory, task, thread)
    }

    /// Set where a thread resumes and whether it runs privileged
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`], [`TaskError::TaskNotFound`] or
    /// [`TaskError::ThreadNotFound`]
    pub fn set_pc(
        &self,
        job: JobId,
        task: TaskId,
        thread: ThreadId,
        pc: VirtAddr,
        privileged: bool,
    ) -> KernelResult<()> {
        self.with_thread_mut(job, task, thread, |t| t.set_pc(pc, privileged))
    }

    /// Block or unblock a thread
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`], [`TaskError::TaskNotFound`] or
    /// [`TaskError::ThreadNotFound`]
    pub fn set_blocked(
        &self,
        job: JobId,
        task: TaskId,
        thread: ThreadId,
        blocked: bool,
    ) -> KernelResult<()> {
        self.with_thread_mut(job, task, thread, |t| match (blocked, t.status()) {
            (true, _) => t.set_status(ThreadStatus::Blocked),
            (false, ThreadStatus::Blocked) => t.set_status(ThreadStatus::Ready),
            (false, _) => {}
        })
    }

    /// Register a loader symbol on a job
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`] if the handle is stale
    pub fn add_symbol(&self, job: JobId, name: &str, addr: VirtAddr) -> KernelResult<()> {
        self.with_job_mut(job, |j| j.symbols_mut().insert(name, addr))
    }

    /// Run `f` on a job
    ///
    /// # Errors
    ///
    /// [`TaskError::JobNotFound`] if the handle is stale
    pub fn with_job<R>(&self, id: JobId, f: impl FnOnce(&Job<C>) -> R) -> KernelResult<R> {
        let jobs = self.jobs.lock();
        jobs.get(id).map(f).ok_or_else(|| TaskError::JobNotFound.into())
    }

    fn with_job_mut<R>(&self, id: JobId, f: impl FnOnce(&mut Job<C>) -> R) -> KernelResult<R> {
        let mut jobs = self.jobs.lock();
        jobs.get_mut(id).map(f).ok_or_else(|| TaskError::JobNotFound.into())
    }

    fn with_thread_mut<R>(
        &self,
        job: JobId,
        task: TaskId,
        thread: ThreadId,
        f: impl FnOnce(&mut Thread<C>) -> R,
    ) -> KernelResult<R> {
        let mut jobs = self.jobs.lock();
        let thread = jobs
            .get_mut(job)
            .ok_or(TaskError::JobNotFound)?
            .task_mut(task)
            .ok_or(TaskError::TaskNotFound)?
            .thread_mut(thread)
            .ok_or(TaskError::ThreadNotFound)?;
        Ok(f(thread))
    }
}

#[cfg(test)]
mod tests {
    use crate::arch::ProcessorContext;
    use crate::arch::s390x::{S390Context, psw_bits};
    use crate::kernel::core::{ErrorKind, UserId};
    use crate::kernel::mm::VirtAddr;
    use crate::kernel::process::{JobFlags, ThreadStatus};
    use crate::kernel::state::tests::{booted, fresh};

    #[test]
    fn job_starts_asleep_and_inherits_owner() {
        let (kernel, _buf) = fresh();
        let job = kernel.create_job("JOB1", 1, JobFlags::empty(), 65535).unwrap();
        kernel
            .with_job(job, |j| {
                assert!(j.is_asleep());
                assert_eq!(j.owner(), UserId(kernel.config().boot_user));
                assert_eq!(j.priority(), 1);
                assert!(j.address_space().is_none());
            })
            .unwrap();
        kernel.wake_job(job).unwrap();
        assert!(!kernel.with_job(job, |j| j.is_asleep()).unwrap());
        kernel.sleep_job(job).unwrap();
        assert!(kernel.with_job(job, |j| j.is_asleep()).unwrap());
    }

    #[test]
    fn long_names_are_rejected() {
        let (kernel, _buf) = fresh();
        let err = kernel
            .create_job("NINECHARS", 0, JobFlags::empty(), 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
        assert_eq!(kernel.job_count(), 0);
    }

    #[test]
    fn stack_quota_is_enforced() {
        let (kernel, _buf) = fresh();
        let job = kernel.create_job("SMALL", 0, JobFlags::empty(), 8192).unwrap();
        let task = kernel.create_task(job, "T").unwrap();
        kernel.create_thread(job, task, 8192).unwrap();
        let used = kernel.memory().get_stats().used;

        let err = kernel.create_thread(job, task, 4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert_eq!(kernel.memory().get_stats().used, used);
        assert_eq!(kernel.with_job(job, |j| j.mem_used()).unwrap(), 8192);
    }

    #[test]
    fn out_of_memory_leaves_no_thread_behind() {
        let (kernel, _buf) = fresh();
        let job = kernel.create_job("BIG", 0, JobFlags::empty(), 0).unwrap();
        let task = kernel.create_task(job, "T").unwrap();
        let err = kernel.create_thread(job, task, 1 << 24).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        kernel
            .with_job(job, |j| {
                assert!(j.tasks()[0].threads().is_empty());
                assert_eq!(j.mem_used(), 0);
            })
            .unwrap();
    }

    #[test]
    fn set_pc_selects_problem_state() {
        let (kernel, _buf) = fresh();
        let job = kernel.create_job("PC", 0, JobFlags::empty(), 0).unwrap();
        let task = kernel.create_task(job, "T").unwrap();
        let thread = kernel.create_thread(job, task, 0).unwrap();

        kernel
            .set_pc(job, task, thread, VirtAddr::new(0x2000), false)
            .unwrap();
        kernel
            .with_job(job, |j| {
                let ctx: &S390Context = j.task(task).unwrap().thread(thread).unwrap().context();
                assert_eq!(ctx.program_counter(), VirtAddr::new(0x2000));
                assert!(!ctx.is_privileged());
                assert!(ctx.translation_enabled());
                assert_ne!(ctx.psw.mask & psw_bits::PROBLEM, 0);
            })
            .unwrap();

        kernel
            .set_pc(job, task, thread, VirtAddr::new(0x3000), true)
            .unwrap();
        kernel
            .with_job(job, |j| {
                assert!(j.task(task).unwrap().thread(thread).unwrap().context().is_privileged());
            })
            .unwrap();
    }

    #[test]
    fn destroy_job_returns_everything() {
        let (kernel, _buf) = fresh();
        let before = kernel.memory().get_stats();

        let job = kernel.create_job("GONE", 0, JobFlags::VIRTUAL, 0).unwrap();
        let task = kernel.create_task(job, "T").unwrap();
        kernel.create_thread(job, task, 8192).unwrap();
        kernel.create_thread(job, task, 4096).unwrap();
        kernel.add_symbol(job, "main", VirtAddr::new(0x1000)).unwrap();

        kernel.destroy_job(job).unwrap();
        assert_eq!(kernel.memory().get_stats(), before);
        assert_eq!(
            kernel.wake_job(job).unwrap_err().kind(),
            ErrorKind::ResourceExpected
        );
        assert!(kernel.destroy_job(job).is_err());
    }

    #[test]
    fn removing_a_thread_unmaps_its_stack() {
        let (kernel, _buf) = fresh();
        let job = kernel.create_job("VIRT", 0, JobFlags::VIRTUAL, 0).unwrap();
        let task = kernel.create_task(job, "T").unwrap();
        let thread = kernel.create_thread(job, task, 4096).unwrap();
        let base = kernel
            .with_job(job, |j| j.task(task).unwrap().thread(thread).unwrap().stack().unwrap().base())
            .unwrap();

        kernel.remove_thread(job, task, thread).unwrap();
        kernel
            .with_job(job, |j| {
                let space = j.address_space().unwrap();
                assert!(space.virtual_to_real(kernel.memory(), VirtAddr::identity(base)).is_none());
                assert_eq!(j.mem_used(), 0);
            })
            .unwrap();
    }

    #[test]
    fn blocked_threads_wait_until_released() {
        let (kernel, _buf) = booted();
        let job = kernel.create_job("WAIT", 0, JobFlags::empty(), 0).unwrap();
        let task = kernel.create_task(job, "T").unwrap();
        let thread = kernel.create_thread(job, task, 0).unwrap();
        kernel.set_blocked(job, task, thread, true).unwrap();
        kernel.wake_job(job).unwrap();

        // only the bootstrap thread is runnable
        assert_ne!(kernel.schedule().unwrap().job, job);
        kernel.set_blocked(job, task, thread, false).unwrap();
        assert_eq!(kernel.schedule().unwrap().thread, thread);
        kernel
            .with_job(job, |j| {
                assert_eq!(j.task(task).unwrap().thread(thread).unwrap().status(), ThreadStatus::Running);
            })
            .unwrap();
    }
}
