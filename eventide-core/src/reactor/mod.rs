use self::selector::{c_int, Selector};
use crate::clock::Clock;
use crate::common::Named;
use crate::constants::{HookResult, ReactorState, RunMode};
use crate::scheduler::task::{Task, TaskResult};
use crate::scheduler::TaskScheduler;
use eventide_timer::{TimerHandle, TimerQueue};
use polling::Events;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind};
use std::num::NonZeroUsize;
use std::panic::UnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod selector;

#[cfg(test)]
mod tests;

const EVENTS_CAPACITY: usize = 1024;

type OneShotFn = Box<dyn FnOnce(&Reactor) + Send>;

type HookFn = Box<dyn FnMut(&Reactor) -> HookResult>;

type TimerFn = Box<dyn FnOnce(&Reactor)>;

/// The cross-thread half of a `Reactor`.
///
/// Everything else on the reactor is loop-thread-only; this is the single
/// structure other threads may touch. A post appends to the locked one-shot
/// queue and wakes the loop if it is blocked in the poll step, so task
/// completions reach the loop without ever running on a worker thread.
pub struct ReactorRemote {
    ready: Mutex<VecDeque<OneShotFn>>,
    poller: Arc<polling::Poller>,
    inflight: AtomicUsize,
}

impl Debug for ReactorRemote {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorRemote")
            .field("pending", &self.pending())
            .field("inflight", &self.inflight)
            .finish_non_exhaustive()
    }
}

impl ReactorRemote {
    /// Append a one-shot callback to the reactor's queue; safe from any
    /// thread.
    pub fn post(&self, callback: impl FnOnce(&Reactor) + Send + 'static) {
        self.ready.lock().unwrap().push_back(Box::new(callback));
        _ = self.poller.notify();
    }

    /// Number of submitted tasks whose completion callback has not run yet.
    #[must_use]
    pub fn inflight_tasks(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    fn post_front(&self, callback: OneShotFn) {
        self.ready.lock().unwrap().push_front(callback);
        _ = self.poller.notify();
    }

    fn pending(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    fn take_batch(&self) -> VecDeque<OneShotFn> {
        std::mem::take(&mut *self.ready.lock().unwrap())
    }
}

#[derive(Default)]
struct IoEntry {
    read: Option<HookFn>,
    write: Option<HookFn>,
}

/// The single-threaded cooperative event loop.
///
/// One iteration runs the prepare hooks, polls I/O readiness, dispatches
/// matching readiness callbacks, drains the one-shot queue, fires due timers
/// and, only if none of that produced work, runs the idle hooks. Nothing
/// called from the loop may block without stalling it; blocking work belongs
/// on the bound scheduler via `submit`.
pub struct Reactor {
    name: String,
    clock: Arc<dyn Clock>,
    scheduler: Option<Arc<TaskScheduler>>,
    remote: Arc<ReactorRemote>,
    selector: Selector,
    timers: RefCell<TimerQueue<TimerFn>>,
    prepare_hooks: RefCell<Vec<HookFn>>,
    idle_hooks: RefCell<Vec<HookFn>>,
    io_handlers: RefCell<HashMap<c_int, IoEntry>>,
    state: Cell<ReactorState>,
    iterations: Cell<usize>,
    stop: Cell<bool>,
}

impl Debug for Reactor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("iterations", &self.iterations.get())
            .field("timers", &self.timers.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Named for Reactor {
    fn get_name(&self) -> &str {
        &self.name
    }
}

impl Reactor {
    /// Create a reactor bound to `clock`, optionally backed by a task
    /// scheduler for `submit`.
    ///
    /// # Errors
    /// if the I/O readiness backend cannot be created.
    pub fn new(
        name: Option<String>,
        clock: Arc<dyn Clock>,
        scheduler: Option<Arc<TaskScheduler>>,
    ) -> std::io::Result<Self> {
        let selector = Selector::new()?;
        let remote = Arc::new(ReactorRemote {
            ready: Mutex::new(VecDeque::new()),
            poller: selector.notifier(),
            inflight: AtomicUsize::new(0),
        });
        Ok(Reactor {
            name: name.unwrap_or_else(|| format!("eventide-reactor-{}", uuid::Uuid::new_v4())),
            clock,
            scheduler,
            remote,
            selector,
            timers: RefCell::new(TimerQueue::default()),
            prepare_hooks: RefCell::new(Vec::new()),
            idle_hooks: RefCell::new(Vec::new()),
            io_handlers: RefCell::new(HashMap::new()),
            state: Cell::new(ReactorState::Idle),
            iterations: Cell::new(0),
            stop: Cell::new(false),
        })
    }

    /// The bound clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The bound scheduler, if any.
    #[must_use]
    pub fn scheduler(&self) -> Option<&Arc<TaskScheduler>> {
        self.scheduler.as_ref()
    }

    /// The handle other threads use to post callbacks onto this reactor.
    #[must_use]
    pub fn remote(&self) -> Arc<ReactorRemote> {
        self.remote.clone()
    }

    /// Get the state of this reactor.
    #[must_use]
    pub fn get_state(&self) -> ReactorState {
        self.state.get()
    }

    /// Iterations completed since construction.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iterations.get()
    }

    /// Request the loop to stop; honored only at the top of the next
    /// iteration, never pre-emptively.
    pub fn stop(&self) {
        self.stop.set(true);
    }

    /// Register a hook run at the start of every iteration.
    pub fn on_prepare(&self, hook: impl FnMut(&Reactor) -> HookResult + 'static) {
        self.prepare_hooks.borrow_mut().push(Box::new(hook));
    }

    /// Register a hook run only when an iteration produced no other work.
    pub fn on_idle(&self, hook: impl FnMut(&Reactor) -> HookResult + 'static) {
        self.idle_hooks.borrow_mut().push(Box::new(hook));
    }

    /// Queue a one-shot callback at the back of the ready queue.
    pub fn post(&self, callback: impl FnOnce(&Reactor) + Send + 'static) {
        self.remote.post(callback);
    }

    /// Queue a one-shot callback at the front: it runs before previously
    /// queued normal callbacks, but after a batch already being drained.
    pub fn post_priority(&self, callback: impl FnOnce(&Reactor) + Send + 'static) {
        self.remote.post_front(Box::new(callback));
    }

    /// Arm a timer firing at the absolute clock reading `deadline`.
    pub fn at(&self, deadline: u64, callback: impl FnOnce(&Reactor) + 'static) -> TimerHandle {
        self.timers.borrow_mut().insert(deadline, Box::new(callback))
    }

    /// Arm a timer firing `delay` after the bound clock's current reading.
    pub fn delay(&self, delay: Duration, callback: impl FnOnce(&Reactor) + 'static) -> TimerHandle {
        self.at(self.clock.timeout_time(delay), callback)
    }

    /// Cancel a pending timer, returning `true` if it was still pending.
    /// Loop thread only, like every timer operation.
    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.timers.borrow_mut().cancel(handle).is_some()
    }

    /// Watch `fd` for readability; the handler decides on each dispatch
    /// whether to stay registered.
    ///
    /// # Errors
    /// if `fd` is invalid or the backend refuses it.
    pub fn add_read_event(
        &self,
        fd: c_int,
        handler: impl FnMut(&Reactor) -> HookResult + 'static,
    ) -> std::io::Result<()> {
        let token = usize::try_from(fd)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid handle"))?;
        self.selector.add_read_event(fd, token)?;
        let mut handlers = self.io_handlers.borrow_mut();
        handlers.entry(fd).or_default().read = Some(Box::new(handler));
        Ok(())
    }

    /// Watch `fd` for writability; the handler decides on each dispatch
    /// whether to stay registered.
    ///
    /// # Errors
    /// if `fd` is invalid or the backend refuses it.
    pub fn add_write_event(
        &self,
        fd: c_int,
        handler: impl FnMut(&Reactor) -> HookResult + 'static,
    ) -> std::io::Result<()> {
        let token = usize::try_from(fd)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid handle"))?;
        self.selector.add_write_event(fd, token)?;
        let mut handlers = self.io_handlers.borrow_mut();
        handlers.entry(fd).or_default().write = Some(Box::new(handler));
        Ok(())
    }

    /// Stop watching `fd` for readability.
    ///
    /// # Errors
    /// if the backend refuses the update.
    pub fn del_read_event(&self, fd: c_int) -> std::io::Result<()> {
        self.selector.del_read_event(fd)?;
        let mut handlers = self.io_handlers.borrow_mut();
        let prune = handlers.get_mut(&fd).map_or(false, |entry| {
            entry.read = None;
            entry.write.is_none()
        });
        if prune {
            _ = handlers.remove(&fd);
        }
        Ok(())
    }

    /// Stop watching `fd` for writability.
    ///
    /// # Errors
    /// if the backend refuses the update.
    pub fn del_write_event(&self, fd: c_int) -> std::io::Result<()> {
        self.selector.del_write_event(fd)?;
        let mut handlers = self.io_handlers.borrow_mut();
        let prune = handlers.get_mut(&fd).map_or(false, |entry| {
            entry.write = None;
            entry.read.is_none()
        });
        if prune {
            _ = handlers.remove(&fd);
        }
        Ok(())
    }

    /// Stop watching `fd` entirely.
    ///
    /// # Errors
    /// if the backend refuses the update.
    pub fn del_event(&self, fd: c_int) -> std::io::Result<()> {
        self.selector.del_event(fd)?;
        _ = self.io_handlers.borrow_mut().remove(&fd);
        Ok(())
    }

    /// Submit a task to the bound scheduler.
    ///
    /// The worker never invokes `done` itself: the completion is posted back
    /// through the remote and runs on the loop thread. Keep the scheduler
    /// alive until the loop has drained the completion, a task stopped
    /// before running would leave the loop waiting.
    ///
    /// # Errors
    /// if no scheduler is bound, or see `TaskScheduler::submit`.
    pub fn submit(
        &self,
        name: Option<String>,
        func: impl FnOnce(Option<usize>) -> Option<usize> + Send + UnwindSafe + 'static,
        done: impl FnOnce(&Reactor, TaskResult) + Send + 'static,
        param: Option<usize>,
        group: usize,
        dependencies: &[Arc<Task>],
    ) -> std::io::Result<Arc<Task>> {
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Unsupported, "no task scheduler bound"))?;
        let task = scheduler.allocate(name, func, param);
        for dep in dependencies {
            scheduler.add_dependency(&task, dep)?;
        }
        _ = self.remote.inflight.fetch_add(1, Ordering::AcqRel);
        let completion_remote = self.remote.clone();
        task.attach_done(Box::new(move |result| {
            let drain_remote = completion_remote.clone();
            completion_remote.post(move |reactor| {
                _ = drain_remote.inflight.fetch_sub(1, Ordering::AcqRel);
                done(reactor, result);
            });
        }));
        if let Err(e) = scheduler.submit(&task, group) {
            _ = self.remote.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(task)
    }

    /// Run the reactor.
    ///
    /// `Loop` iterates until `stop()` is observed or no work source remains,
    /// and returns the iteration count. `Once` runs exactly one iteration
    /// and returns 1 if any work ran; `NoWait` does the same but never
    /// blocks in the poll step.
    ///
    /// # Errors
    /// if polling the I/O readiness backend failed.
    pub fn run(&self, mode: RunMode) -> std::io::Result<usize> {
        match mode {
            RunMode::Loop => {
                let mut iterations = 0_usize;
                loop {
                    if self.stop.replace(false) {
                        self.state.set(ReactorState::Stopped);
                        crate::info!("{} stopped after {iterations} iterations", self.name);
                        break;
                    }
                    if !self.has_work_sources() {
                        self.state.set(ReactorState::Idle);
                        break;
                    }
                    _ = self.turn(false, true)?;
                    iterations += 1;
                }
                Ok(iterations)
            }
            RunMode::Once => {
                if self.stop.replace(false) {
                    self.state.set(ReactorState::Stopped);
                    return Ok(0);
                }
                self.turn(false, false).map(usize::from)
            }
            RunMode::NoWait => {
                if self.stop.replace(false) {
                    self.state.set(ReactorState::Stopped);
                    return Ok(0);
                }
                self.turn(true, false).map(usize::from)
            }
        }
    }

    fn has_work_sources(&self) -> bool {
        !self.prepare_hooks.borrow().is_empty()
            || !self.idle_hooks.borrow().is_empty()
            || !self.timers.borrow().is_empty()
            || !self.io_handlers.borrow().is_empty()
            || self.remote.pending() > 0
            || self.remote.inflight_tasks() > 0
    }

    fn turn(&self, no_wait: bool, allow_indefinite: bool) -> std::io::Result<bool> {
        self.state.set(ReactorState::Preparing);
        _ = self.run_hooks(&self.prepare_hooks);
        let timeout = if no_wait {
            Some(Duration::ZERO)
        } else if !self.idle_hooks.borrow().is_empty() || self.remote.pending() > 0 {
            // idle work and queued callbacks must not wait behind the poll
            Some(Duration::ZERO)
        } else {
            match self.timers.borrow().peek_deadline() {
                Some(deadline) => Some(Duration::from_nanos(
                    deadline.saturating_sub(self.clock.now()),
                )),
                None if allow_indefinite => None,
                None => Some(Duration::ZERO),
            }
        };
        self.state.set(ReactorState::Polling);
        let mut events =
            Events::with_capacity(NonZeroUsize::new(EVENTS_CAPACITY).expect("non-zero capacity"));
        _ = self.selector.select(&mut events, timeout)?;
        self.state.set(ReactorState::Dispatching);
        let mut dispatched = 0_usize;
        for event in events.iter() {
            if let Ok(fd) = c_int::try_from(event.key) {
                if event.readable {
                    dispatched += self.dispatch_io(fd, true);
                }
                if event.writable {
                    dispatched += self.dispatch_io(fd, false);
                }
            }
        }
        let mut batch = self.remote.take_batch();
        let drained = batch.len();
        for callback in batch.drain(..) {
            callback(self);
        }
        let fired = self.fire_timers();
        let mut worked = dispatched + drained + fired > 0;
        if !worked {
            //idle work never starves I/O or timers
            worked = self.run_hooks(&self.idle_hooks) > 0;
        }
        self.iterations.set(self.iterations.get() + 1);
        self.state.set(ReactorState::Idle);
        Ok(worked)
    }

    /// Run every hook in `cell`, dropping those that unregister themselves.
    /// The list is taken out for the walk, so hooks may register new hooks
    /// re-entrantly; survivors keep their order ahead of the newcomers.
    fn run_hooks(&self, cell: &RefCell<Vec<HookFn>>) -> usize {
        let current = std::mem::take(&mut *cell.borrow_mut());
        let invoked = current.len();
        let mut kept = Vec::with_capacity(invoked);
        for mut hook in current {
            if HookResult::Continue == hook(self) {
                kept.push(hook);
            }
        }
        let mut hooks = cell.borrow_mut();
        let added = std::mem::replace(&mut *hooks, kept);
        hooks.extend(added);
        invoked
    }

    fn fire_timers(&self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        loop {
            let due = self.timers.borrow_mut().pop_due(now);
            let Some((_, callback)) = due else { break };
            callback(self);
            fired += 1;
        }
        fired
    }

    fn dispatch_io(&self, fd: c_int, readable: bool) -> usize {
        let taken = {
            let mut handlers = self.io_handlers.borrow_mut();
            handlers.get_mut(&fd).and_then(|entry| {
                if readable {
                    entry.read.take()
                } else {
                    entry.write.take()
                }
            })
        };
        let Some(mut handler) = taken else { return 0 };
        match handler(self) {
            HookResult::Continue => {
                {
                    let mut handlers = self.io_handlers.borrow_mut();
                    if let Some(entry) = handlers.get_mut(&fd) {
                        let slot = if readable {
                            &mut entry.read
                        } else {
                            &mut entry.write
                        };
                        // the handler may have replaced itself re-entrantly
                        if slot.is_none() {
                            *slot = Some(handler);
                        }
                    }
                }
                if let Err(e) = self.selector.renew(fd) {
                    crate::error!("{} failed to re-arm fd {fd}: {e}", self.name);
                }
            }
            HookResult::Unregister => {
                let result = if readable {
                    self.selector.del_read_event(fd)
                } else {
                    self.selector.del_write_event(fd)
                };
                if let Err(e) = result {
                    crate::error!("{} failed to deregister fd {fd}: {e}", self.name);
                }
                let mut handlers = self.io_handlers.borrow_mut();
                let prune = handlers
                    .get_mut(&fd)
                    .map_or(false, |entry| entry.read.is_none() && entry.write.is_none());
                if prune {
                    _ = handlers.remove(&fd);
                }
            }
        }
        1
    }
}
