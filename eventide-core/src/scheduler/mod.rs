use crate::common::Named;
use crate::constants::SchedulerState;
use crate::pool::WorkerPool;
use crate::scheduler::task::{Task, TaskResult};
use core_affinity::CoreId;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind};
use std::panic::UnwindSafe;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Task abstraction and impl.
pub mod task;


#[derive(Debug)]
struct GroupInner {
    queue: VecDeque<Arc<Task>>,
    running: bool,
}

#[derive(Debug)]
struct Group {
    inner: Mutex<GroupInner>,
    cond: Condvar,
}

impl Group {
    fn new() -> Self {
        Group {
            inner: Mutex::new(GroupInner {
                queue: VecDeque::new(),
                running: true,
            }),
            cond: Condvar::new(),
        }
    }
}

/// The worker loop shared by every thread of a group.
///
/// Only the head of the queue may be popped, and only once every dependency
/// of the head has run: a gated head blocks its whole group on purpose, even
/// when later entries are runnable.
fn worker_loop(groups: &[Group], index: usize) {
    let group = &groups[index];
    loop {
        let task = {
            let mut inner = group.inner.lock().unwrap();
            loop {
                if !inner.running {
                    return;
                }
                if let Some(head) = inner.queue.front() {
                    if head.dependencies_ran() {
                        break;
                    }
                }
                inner = group.cond.wait(inner).unwrap();
            }
            inner.queue.pop_front().expect("queue head vanished")
        };
        task.run();
        // a dependency may gate the head of any group
        for other in groups {
            other.cond.notify_all();
        }
    }
}

/// Builder fixing the group/thread layout of a `TaskScheduler`.
///
/// Either an explicit group count, or a core set from which the layout is
/// derived: one group per core, every thread of that group pinned to it.
#[derive(Debug)]
pub struct SchedulerBuilder {
    name: Option<String>,
    groups: usize,
    threads_per_group: usize,
    cores: Option<Vec<CoreId>>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        SchedulerBuilder {
            name: None,
            groups: num_cpus::get().max(1),
            threads_per_group: 1,
            cores: None,
        }
    }
}

impl SchedulerBuilder {
    /// Create a builder with one group per CPU and one thread per group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduler name.
    #[must_use]
    pub fn name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    /// Set the number of independent groups.
    #[must_use]
    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Set the number of worker threads backing each group.
    #[must_use]
    pub fn threads_per_group(mut self, threads_per_group: usize) -> Self {
        self.threads_per_group = threads_per_group;
        self
    }

    /// Derive the layout from `cores` instead of a plain group count.
    #[must_use]
    pub fn cores(mut self, cores: Vec<CoreId>) -> Self {
        self.cores = Some(cores);
        self
    }

    /// Build the scheduler and start its worker threads.
    ///
    /// # Errors
    /// if the layout is empty or a worker thread cannot be spawned.
    pub fn build(self) -> std::io::Result<Arc<TaskScheduler>> {
        let group_count = self.cores.as_ref().map_or(self.groups, Vec::len);
        if group_count == 0 || self.threads_per_group == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "a scheduler needs at least one group and one thread per group",
            ));
        }
        let name = self
            .name
            .unwrap_or_else(|| format!("eventide-scheduler-{}", uuid::Uuid::new_v4()));
        let groups: Arc<[Group]> = (0..group_count).map(|_| Group::new()).collect::<Vec<_>>().into();
        let entry_groups = groups.clone();
        let pool = WorkerPool::new(format!("{name}-worker"), move |param| {
            let index = param.expect("worker thread started without a group index");
            worker_loop(&entry_groups, index);
        });
        for group in 0..group_count {
            let core = self.cores.as_ref().map(|cores| cores[group]);
            for _ in 0..self.threads_per_group {
                if let Err(e) = pool.start_thread(core, Some(group)) {
                    // unwind the workers already started
                    for started in groups.iter() {
                        started.inner.lock().unwrap().running = false;
                        started.cond.notify_all();
                    }
                    pool.join();
                    return Err(e);
                }
            }
        }
        let scheduler = TaskScheduler {
            name,
            groups,
            pool,
            state: Mutex::new(SchedulerState::Created),
        };
        assert_eq!(SchedulerState::Created, scheduler.change_state(SchedulerState::Running));
        Ok(Arc::new(scheduler))
    }
}

/// Grouped, dependency-aware work queues on top of a `WorkerPool`.
///
/// Each group is an independent FIFO served by its own slice of worker
/// threads; groups interact only through task dependencies, which may cross
/// groups.
pub struct TaskScheduler {
    name: String,
    groups: Arc<[Group]>,
    pool: WorkerPool,
    state: Mutex<SchedulerState>,
}

impl Debug for TaskScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("name", &self.name)
            .field("groups", &self.groups.len())
            .field("state", &self.get_state())
            .finish_non_exhaustive()
    }
}

impl Named for TaskScheduler {
    fn get_name(&self) -> &str {
        &self.name
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl TaskScheduler {
    /// Number of groups fixed at construction.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Returns the number of tasks waiting in every group.
    #[must_use]
    pub fn size(&self) -> usize {
        self.groups
            .iter()
            .map(|group| group.inner.lock().unwrap().queue.len())
            .sum()
    }

    /// Returns `true` if no task is waiting in any group.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of worker threads currently running.
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.pool.running_threads()
    }

    /// Get the state of this scheduler.
    #[must_use]
    pub fn get_state(&self) -> SchedulerState {
        *self.state.lock().unwrap()
    }

    fn change_state(&self, state: SchedulerState) -> SchedulerState {
        std::mem::replace(&mut *self.state.lock().unwrap(), state)
    }

    /// Create a new unqueued task.
    pub fn allocate(
        &self,
        name: Option<String>,
        func: impl FnOnce(Option<usize>) -> Option<usize> + Send + UnwindSafe + 'static,
        param: Option<usize>,
    ) -> Arc<Task> {
        Arc::new(Task::new(
            name.unwrap_or(format!("{}|{}", self.name, uuid::Uuid::new_v4())),
            func,
            param,
        ))
    }

    /// Attach `dep` to `task`.
    ///
    /// # Errors
    /// if `task` is already queued, or `dep` is not itself queued yet.
    pub fn add_dependency(&self, task: &Arc<Task>, dep: &Arc<Task>) -> std::io::Result<()> {
        task.add_dependency(dep)
    }

    /// Commit `task` to `group`'s FIFO and wake that group's workers.
    ///
    /// Once submitted a task cannot be cancelled; it runs as soon as it
    /// reaches the head of its group with all dependencies run.
    ///
    /// # Errors
    /// if `group` is out of range, `task` is already queued, or the
    /// scheduler is stopping.
    pub fn submit(&self, task: &Arc<Task>, group: usize) -> std::io::Result<()> {
        let group = self.groups.get(group).ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "group index out of range")
        })?;
        if !task.mark_queued() {
            return Err(Error::new(ErrorKind::InvalidInput, "task already queued"));
        }
        let mut inner = group.inner.lock().unwrap();
        if !inner.running {
            return Err(Error::new(ErrorKind::BrokenPipe, "scheduler is stopping"));
        }
        inner.queue.push_back(task.clone());
        group.cond.notify_all();
        Ok(())
    }

    /// Allocate and submit in one step.
    ///
    /// # Errors
    /// see `submit`.
    pub fn submit_fn(
        &self,
        name: Option<String>,
        func: impl FnOnce(Option<usize>) -> Option<usize> + Send + UnwindSafe + 'static,
        param: Option<usize>,
        group: usize,
    ) -> std::io::Result<Arc<Task>> {
        let task = self.allocate(name, func, param);
        self.submit(&task, group)?;
        Ok(task)
    }

    /// Submit a new task and wait for it to complete.
    ///
    /// # Errors
    /// see `submit` and `Task::wait_result`.
    pub fn submit_and_wait(
        &self,
        name: Option<String>,
        func: impl FnOnce(Option<usize>) -> Option<usize> + Send + UnwindSafe + 'static,
        param: Option<usize>,
        group: usize,
        wait_time: Duration,
    ) -> std::io::Result<TaskResult> {
        let task = self.submit_fn(name, func, param, group)?;
        task.wait_result(wait_time)
    }

    /// Refuse new tasks and wake every worker; each exits after finishing
    /// the task it has in flight. Tasks still queued are dropped unrun.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, SchedulerState::Stopping | SchedulerState::Stopped) {
                return;
            }
            *state = SchedulerState::Stopping;
        }
        for group in self.groups.iter() {
            group.inner.lock().unwrap().running = false;
            group.cond.notify_all();
        }
        crate::info!("{} is stopping", self.name);
    }

    /// Wait for every worker thread to exit.
    pub fn join(&self) {
        self.pool.join();
        let mut state = self.state.lock().unwrap();
        if SchedulerState::Stopping == *state {
            *state = SchedulerState::Stopped;
        }
    }
}
