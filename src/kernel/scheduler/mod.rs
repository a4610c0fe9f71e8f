//! Round-robin scheduler
//!
//! Jobs, tasks and threads are visited like the wheels of an odometer: the
//! thread cursor advances first, a wrap moves on to the next task, and a wrap
//! of the task cursor moves on to the next job in slot order. Sleeping jobs,
//! jobs without tasks, empty tasks and blocked threads are skipped.
//! `priority` is recorded on each job but not used here.

use crate::arch::ProcessorContext;
use crate::kernel::core::{ErrorKind, JobId, KernelError, KernelResult};
use crate::kernel::process::switch::{dispatch, Position};
use crate::kernel::process::table::JobTable;
use crate::kernel::process::{Dispatched, Job, Thread};
use crate::kernel::state::KernelState;

/// Simple round-robin scheduler
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinScheduler;

impl RoundRobinScheduler {
    /// Select the next thread to run
    ///
    /// The search starts just after the last dispatched thread (or at the
    /// stored cursors of its job when that thread is gone) and covers every
    /// job at most once before coming back to the starting job from its
    /// first task. A single runnable thread is therefore picked again.
    /// Returns `None` when nothing in the table is runnable.
    #[must_use]
    pub fn next<C: ProcessorContext>(table: &JobTable<C>) -> Option<Position> {
        let capacity = table.capacity();
        if capacity == 0 {
            return None;
        }

        let start = match table.current() {
            Some(cursor) => {
                let index = cursor.job.index() as usize;
                if let Some(job) = table.get(cursor.job).filter(|j| j.is_dispatchable()) {
                    let (task, thread) = stored_cursor(job);
                    let still_current = job
                        .tasks()
                        .get(task)
                        .filter(|t| t.id() == cursor.task)
                        .and_then(|t| t.threads().get(thread))
                        .is_some_and(|t| t.id() == cursor.thread);
                    let from = if still_current { thread + 1 } else { thread };
                    if let Some(found) = scan(job, task, from) {
                        return Some(at(index, found));
                    }
                }
                index
            }
            None => {
                if let Some(job) = table.get_by_index(0).filter(|j| j.is_dispatchable()) {
                    let (task, thread) = stored_cursor(job);
                    if let Some(found) = scan(job, task, thread) {
                        return Some(at(0, found));
                    }
                }
                0
            }
        };

        for step in 1..=capacity {
            let index = (start + step) % capacity;
            let Some(job) = table.get_by_index(index).filter(|j| j.is_dispatchable()) else {
                continue;
            };
            let found = if index == start {
                scan(job, 0, 0)
            } else {
                let (task, thread) = stored_cursor(job);
                scan(job, task, thread).or_else(|| scan(job, 0, 0))
            };
            if let Some(found) = found {
                return Some(at(index, found));
            }
        }

        None
    }
}

fn at(job: usize, (task, thread): (usize, usize)) -> Position {
    Position { job, task, thread }
}

fn stored_cursor<C: ProcessorContext>(job: &Job<C>) -> (usize, usize) {
    let task = job.current_task();
    let thread = job.tasks().get(task).map_or(0, |t| t.current_thread());
    (task, thread)
}

/// First runnable thread at or after `(task, thread)` inside `job`
fn scan<C: ProcessorContext>(job: &Job<C>, task: usize, thread: usize) -> Option<(usize, usize)> {
    let mut from = thread;
    for (t, entry) in job.tasks().iter().enumerate().skip(task) {
        if let Some(offset) = entry
            .threads()
            .iter()
            .skip(from)
            .position(Thread::is_runnable)
        {
            return Some((t, from + offset));
        }
        from = 0;
    }
    None
}

impl<C: ProcessorContext> KernelState<C> {
    /// Dispatch the next runnable thread
    ///
    /// Runs to completion with the job table and the processor state locked,
    /// in that order.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ResourceUnavailable`] when no thread is runnable; the
    /// previously dispatched thread stays loaded.
    pub fn schedule(&self) -> KernelResult<Dispatched> {
        let mut jobs = self.jobs.lock();
        let mut cpu = self.cpu.lock();

        RoundRobinScheduler::next(&jobs)
            .and_then(|position| dispatch(&mut jobs, &mut cpu, position))
            .ok_or(KernelError::with_context(
                ErrorKind::ResourceUnavailable,
                "no runnable thread",
            ))
    }

    /// Handle of the job whose thread was dispatched last
    pub fn current_job(&self) -> Option<JobId> {
        let jobs = self.jobs.lock();
        jobs.current()
            .map(|cursor| cursor.job)
            .filter(|&id| jobs.get(id).is_some())
    }

    /// Slot number of the current job
    pub fn current_job_id(&self) -> Option<u32> {
        self.current_job().map(JobId::index)
    }

    /// Run `f` on the current job
    pub fn with_current_job<R>(&self, f: impl FnOnce(&Job<C>) -> R) -> Option<R> {
        let jobs = self.jobs.lock();
        let cursor = jobs.current()?;
        jobs.get(cursor.job).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::s390x::S390Context;
    use crate::kernel::core::{ObjectName, TaskId, ThreadId, UserId};
    use crate::kernel::process::{CpuState, JobFlags, Task, ThreadStatus};

    type Table = JobTable<S390Context>;

    fn add_job(table: &mut Table, tasks: &[&[u64]]) -> JobId {
        table.insert_with(|id| {
            let mut job = Job::new(
                id,
                ObjectName::new("J").unwrap(),
                0,
                JobFlags::empty(),
                0,
                UserId::ROOT,
            );
            for (n, threads) in tasks.iter().enumerate() {
                let mut task = Task::new(TaskId(id.index() as u64 * 100 + n as u64), ObjectName::new("T").unwrap());
                for &tid in *threads {
                    task.push_thread(Thread::new(ThreadId(tid), None));
                }
                job.push_task(task);
            }
            job
        })
    }

    fn run(table: &mut Table, cpu: &mut CpuState<S390Context>) -> Option<u64> {
        let pos = RoundRobinScheduler::next(table)?;
        dispatch(table, cpu, pos).map(|d| d.thread.get())
    }

    #[test]
    fn empty_table_has_nothing_to_run() {
        let table = Table::new();
        assert!(RoundRobinScheduler::next(&table).is_none());
    }

    #[test]
    fn every_thread_runs_before_any_repeats() {
        let mut table = Table::new();
        let mut cpu = CpuState::default();
        add_job(&mut table, &[&[1, 2], &[3]]);
        add_job(&mut table, &[&[4]]);
        add_job(&mut table, &[&[5, 6]]);

        let order: Vec<u64> = (0..12).filter_map(|_| run(&mut table, &mut cpu)).collect();
        assert_eq!(order, [1, 2, 3, 4, 5, 6, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn sleeping_jobs_and_blocked_threads_are_skipped() {
        let mut table = Table::new();
        let mut cpu = CpuState::default();
        let a = add_job(&mut table, &[&[1, 2, 3]]);
        let b = add_job(&mut table, &[&[4]]);
        table.get_mut(b).unwrap().set_flags(JobFlags::SLEEP);
        table.get_mut(a).unwrap().tasks_mut()[0].threads_mut()[1].set_status(ThreadStatus::Blocked);

        let order: Vec<u64> = (0..4).filter_map(|_| run(&mut table, &mut cpu)).collect();
        assert_eq!(order, [1, 3, 1, 3]);
    }

    #[test]
    fn single_thread_is_dispatched_again() {
        let mut table = Table::new();
        let mut cpu = CpuState::default();
        add_job(&mut table, &[&[], &[7]]);

        assert_eq!(run(&mut table, &mut cpu), Some(7));
        assert_eq!(run(&mut table, &mut cpu), Some(7));
        assert_eq!(cpu.switches(), 2);
    }

    #[test]
    fn nothing_runnable_when_everything_is_blocked() {
        let mut table = Table::new();
        let mut cpu = CpuState::default();
        let a = add_job(&mut table, &[&[1]]);
        assert_eq!(run(&mut table, &mut cpu), Some(1));

        table.get_mut(a).unwrap().tasks_mut()[0].threads_mut()[0].set_status(ThreadStatus::Blocked);
        assert!(RoundRobinScheduler::next(&table).is_none());
    }

    #[test]
    fn removed_current_thread_resumes_at_successor() {
        let mut table = Table::new();
        let mut cpu = CpuState::default();
        let mem = crate::kernel::mm::RealMemory::new();
        let a = add_job(&mut table, &[&[1, 2, 3]]);
        assert_eq!(run(&mut table, &mut cpu), Some(1));
        assert_eq!(run(&mut table, &mut cpu), Some(2));

        let task = table.get(a).unwrap().tasks()[0].id();
        table.get_mut(a).unwrap().remove_thread(&mem, task, ThreadId(2)).unwrap();
        assert_eq!(run(&mut table, &mut cpu), Some(3));
        assert_eq!(run(&mut table, &mut cpu), Some(1));
    }

    #[test]
    fn dispatch_moves_status_and_statistics() {
        let mut table = Table::new();
        let mut cpu = CpuState::default();
        let a = add_job(&mut table, &[&[1], &[2]]);

        run(&mut table, &mut cpu);
        run(&mut table, &mut cpu);
        let job = table.get(a).unwrap();
        assert_eq!(job.tasks()[0].threads()[0].status(), ThreadStatus::Ready);
        assert_eq!(job.tasks()[1].threads()[0].status(), ThreadStatus::Running);
        assert_eq!(job.tasks()[0].stats().dispatches, 1);
        assert_eq!(job.current_task(), 1);
        assert_eq!(cpu.translation_root(), None);
    }
}
