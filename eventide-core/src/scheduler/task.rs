use crate::common::Named;
use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind};
use std::panic::UnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Result of one task execution: the body's return value, or the panic
/// message if the body panicked.
pub type TaskResult = Result<Option<usize>, &'static str>;

type TaskFn = dyn FnOnce(Option<usize>) -> Option<usize> + Send + UnwindSafe;

pub(crate) type DoneFn = dyn FnOnce(TaskResult) + Send;

/// A unit of work for the scheduler.
///
/// The group FIFO holds one strong handle while the task is queued; a
/// dependent task holds a strong handle to each of its dependencies, so a
/// dependency outlives every dependent still checking it.
pub struct Task {
    name: String,
    func: Mutex<Option<Box<TaskFn>>>,
    param: Mutex<Option<usize>>,
    queued: AtomicBool,
    ran: AtomicBool,
    dependencies: Mutex<Vec<Arc<Task>>>,
    done: Mutex<Option<Box<DoneFn>>>,
    result: Mutex<Option<TaskResult>>,
    finished: Condvar,
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("queued", &self.queued)
            .field("ran", &self.ran)
            .finish_non_exhaustive()
    }
}

impl Named for Task {
    fn get_name(&self) -> &str {
        &self.name
    }
}

impl Task {
    pub(crate) fn new(
        name: String,
        func: impl FnOnce(Option<usize>) -> Option<usize> + Send + UnwindSafe + 'static,
        param: Option<usize>,
    ) -> Self {
        Task {
            name,
            func: Mutex::new(Some(Box::new(func))),
            param: Mutex::new(param),
            queued: AtomicBool::new(false),
            ran: AtomicBool::new(false),
            dependencies: Mutex::new(Vec::new()),
            done: Mutex::new(None),
            result: Mutex::new(None),
            finished: Condvar::new(),
        }
    }

    /// Set a param for this task, returning the previous one.
    pub fn set_param(&self, param: usize) -> Option<usize> {
        self.param.lock().unwrap().replace(param)
    }

    /// Get param from this task.
    #[must_use]
    pub fn get_param(&self) -> Option<usize> {
        *self.param.lock().unwrap()
    }

    /// `true` once the task has been committed to a group.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// `true` once the task body has finished running.
    #[must_use]
    pub fn has_ran(&self) -> bool {
        self.ran.load(Ordering::Acquire)
    }

    /// Attach `dep` so this task cannot start before `dep` has run.
    ///
    /// # Errors
    /// if this task is already queued, or `dep` is not itself queued yet.
    /// Dependencies point only at tasks already committed to a group, so a
    /// cycle cannot be built.
    pub(crate) fn add_dependency(&self, dep: &Arc<Task>) -> std::io::Result<()> {
        if self.is_queued() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "dependencies can only be attached before submit",
            ));
        }
        if !dep.is_queued() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "a dependency must already be queued",
            ));
        }
        self.dependencies.lock().unwrap().push(dep.clone());
        Ok(())
    }

    pub(crate) fn dependencies_ran(&self) -> bool {
        self.dependencies.lock().unwrap().iter().all(|dep| dep.has_ran())
    }

    pub(crate) fn mark_queued(&self) -> bool {
        self.queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn attach_done(&self, done: Box<DoneFn>) {
        _ = self.done.lock().unwrap().replace(done);
    }

    /// exec the task at most once, storing the result, waking result waiters
    /// and firing the completion callback.
    pub(crate) fn run(&self) {
        let Some(func) = self.func.lock().unwrap().take() else {
            return;
        };
        let param = self.get_param();
        let result = std::panic::catch_unwind(move || func(param)).map_err(|e| {
            let message = *e
                .downcast_ref::<&'static str>()
                .unwrap_or(&"task failed without message");
            crate::error!("task:{} finish with error:{}", self.name, message);
            message
        });
        {
            let mut slot = self.result.lock().unwrap();
            *slot = Some(result);
            self.ran.store(true, Ordering::Release);
            self.finished.notify_all();
        }
        if let Some(done) = self.done.lock().unwrap().take() {
            done(result);
        }
    }

    /// Block until the task has run, returning its result.
    ///
    /// # Errors
    /// if `wait_time` elapses first.
    pub fn wait_result(&self, wait_time: Duration) -> std::io::Result<TaskResult> {
        let slot = self.result.lock().unwrap();
        let (slot, _) = self
            .finished
            .wait_timeout_while(slot, wait_time, |slot| slot.is_none())
            .unwrap();
        match *slot {
            Some(result) => Ok(result),
            None => Err(Error::new(ErrorKind::TimedOut, "wait timeout")),
        }
    }
}
