use crate::common::Named;
use core_affinity::CoreId;
use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Entry = dyn Fn(Option<usize>) + Send + Sync;

#[derive(Debug, Default)]
struct PoolInner {
    //about-to-start marker, at most one hand-off in flight
    starting: Option<String>,
    //threads append themselves here once schedulable
    active: Vec<String>,
    handles: Vec<JoinHandle<()>>,
    joined: Vec<String>,
}

struct PoolShared {
    name: String,
    entry: Box<Entry>,
    running: AtomicUsize,
    inner: Mutex<PoolInner>,
    cond: Condvar,
}

/// Manages a named set of OS threads that all run one shared entry function.
///
/// The pool has no scheduling policy of its own; consumers decide what the
/// entry function does with its per-thread param.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sequence: AtomicUsize,
}

impl Debug for WorkerPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("running", &self.running_threads())
            .finish_non_exhaustive()
    }
}

impl Named for WorkerPool {
    fn get_name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_eq!(
                0,
                self.running_threads(),
                "There are still threads running !"
            );
        }
    }
}

impl WorkerPool {
    /// Create a pool whose threads all run `entry` with their per-thread
    /// param.
    pub fn new(name: String, entry: impl Fn(Option<usize>) + Send + Sync + 'static) -> Self {
        WorkerPool {
            shared: Arc::new(PoolShared {
                name,
                entry: Box::new(entry),
                running: AtomicUsize::new(0),
                inner: Mutex::new(PoolInner::default()),
                cond: Condvar::new(),
            }),
            sequence: AtomicUsize::new(0),
        }
    }

    /// Spawn one thread running the shared entry function with `param`,
    /// optionally pinned to `affinity`.
    ///
    /// Does not return before the new thread is schedulable and counted:
    /// the caller blocks until the thread has taken the pool lock, appended
    /// itself to the active list and signalled back.
    ///
    /// # Errors
    /// if the OS refuses to spawn the thread.
    pub fn start_thread(
        &self,
        affinity: Option<CoreId>,
        param: Option<usize>,
    ) -> std::io::Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let thread_name = format!("{}-{sequence}", self.shared.name);
        let shared = self.shared.clone();
        let mut inner = self.shared.inner.lock().unwrap();
        while inner.starting.is_some() {
            inner = self.shared.cond.wait(inner).unwrap();
        }
        inner.starting = Some(thread_name.clone());
        let spawned = std::thread::Builder::new().name(thread_name.clone()).spawn(
            move || {
                if let Some(core) = affinity {
                    _ = core_affinity::set_for_current(core);
                }
                _ = shared.running.fetch_add(1, Ordering::Release);
                {
                    let mut inner = shared.inner.lock().unwrap();
                    assert_eq!(
                        Some(thread_name.as_str()),
                        inner.starting.as_deref(),
                        "worker started without a pending hand-off"
                    );
                    inner.active.push(thread_name.clone());
                    inner.starting = None;
                    shared.cond.notify_all();
                }
                (shared.entry)(param);
                {
                    let mut inner = shared.inner.lock().unwrap();
                    inner.active.retain(|name| name != &thread_name);
                }
                _ = shared.running.fetch_sub(1, Ordering::Release);
            },
        );
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                inner.starting = None;
                self.shared.cond.notify_all();
                return Err(Error::new(ErrorKind::Other, format!("{e:?}")));
            }
        };
        inner.handles.push(handle);
        while inner.starting.is_some() {
            inner = self.shared.cond.wait(inner).unwrap();
        }
        drop(inner);
        Ok(())
    }

    /// Start one thread pinned to `core`.
    ///
    /// # Errors
    /// see `start_thread`.
    pub fn start_thread_on(&self, core: CoreId, param: Option<usize>) -> std::io::Result<()> {
        self.start_thread(Some(core), param)
    }

    /// Start one thread per core in `cores`, each pinned to its core.
    ///
    /// # Errors
    /// see `start_thread`.
    pub fn start_thread_per_core(
        &self,
        cores: &[CoreId],
        param: Option<usize>,
    ) -> std::io::Result<()> {
        for core in cores {
            self.start_thread(Some(*core), param)?;
        }
        Ok(())
    }

    /// Number of threads currently inside the entry function.
    #[must_use]
    pub fn running_threads(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Names of the threads currently registered active.
    #[must_use]
    pub fn active_threads(&self) -> Vec<String> {
        self.shared.inner.lock().unwrap().active.clone()
    }

    /// Names of the threads joined so far.
    #[must_use]
    pub fn joined_threads(&self) -> Vec<String> {
        self.shared.inner.lock().unwrap().joined.clone()
    }

    /// Join every thread started so far.
    ///
    /// The handle list is snapshotted under the lock and joined without it:
    /// exiting threads need the lock to deregister themselves.
    pub fn join(&self) {
        let handles = {
            let mut inner = self.shared.inner.lock().unwrap();
            std::mem::take(&mut inner.handles)
        };
        for handle in handles {
            let name = handle.thread().name().map(String::from).unwrap_or_default();
            if handle.join().is_err() {
                crate::error!("{name} panicked before exit");
            }
            self.shared.inner.lock().unwrap().joined.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gated_pool(name: &str) -> (WorkerPool, Arc<(Mutex<bool>, Condvar)>) {
        let gate = Arc::new((Mutex::new(true), Condvar::new()));
        let entry_gate = gate.clone();
        let pool = WorkerPool::new(String::from(name), move |_| {
            let (lock, cvar) = &*entry_gate;
            let mut pending = lock.lock().unwrap();
            while *pending {
                pending = cvar.wait(pending).unwrap();
            }
        });
        (pool, gate)
    }

    fn open_gate(gate: &Arc<(Mutex<bool>, Condvar)>) {
        let (lock, cvar) = &**gate;
        let mut pending = lock.lock().unwrap();
        *pending = false;
        cvar.notify_all();
    }

    #[test]
    fn start_handshake_counts_synchronously() {
        let (pool, gate) = gated_pool("handshake");
        assert_eq!(0, pool.running_threads());
        for started in 1..=3 {
            pool.start_thread(None, None).unwrap();
            assert_eq!(started, pool.running_threads());
            assert_eq!(started, pool.active_threads().len());
        }
        open_gate(&gate);
        pool.join();
        assert_eq!(0, pool.running_threads());
        assert!(pool.active_threads().is_empty());
        assert_eq!(3, pool.joined_threads().len());
    }

    #[test]
    fn entry_receives_param() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let entry_seen = seen.clone();
        let pool = WorkerPool::new(String::from("param"), move |param| {
            entry_seen.lock().unwrap().push(param);
        });
        pool.start_thread(None, Some(7)).unwrap();
        pool.start_thread(None, None).unwrap();
        pool.join();
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(vec![None, Some(7)], seen);
    }

    #[test]
    fn join_waits_for_exit() {
        let (pool, gate) = gated_pool("join");
        pool.start_thread(None, None).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(1, pool.running_threads());
        open_gate(&gate);
        pool.join();
        assert_eq!(0, pool.running_threads());
    }

    #[test]
    fn pinned_threads_smoke() {
        if let Some(cores) = core_affinity::get_core_ids() {
            let pool = WorkerPool::new(String::from("pinned"), |_| {});
            pool.start_thread_on(cores[0], None).unwrap();
            pool.start_thread_per_core(&cores[..cores.len().min(2)], None)
                .unwrap();
            pool.join();
            assert_eq!(0, pool.running_threads());
        }
    }
}
