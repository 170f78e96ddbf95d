use dashmap::{DashMap, DashSet};
use polling::{Event, Events, Poller};
use std::sync::Arc;
use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        pub(crate) use std::ffi::c_int;
    } else {
        pub(crate) use libc::c_int;
    }
}

/// Event driven abstraction and impl.
///
/// Interest records persist until explicitly deleted; registrations are
/// armed in oneshot mode and re-armed through `renew` after dispatch.
#[derive(Debug)]
pub(crate) struct Selector {
    poller: Arc<Poller>,
    readable_records: DashSet<c_int>,
    readable_token_records: DashMap<c_int, usize>,
    writable_records: DashSet<c_int>,
    writable_token_records: DashMap<c_int, usize>,
}

impl Selector {
    /// # Errors
    /// if create failed.
    pub(crate) fn new() -> std::io::Result<Selector> {
        Ok(Selector {
            poller: Arc::new(Poller::new()?),
            readable_records: DashSet::new(),
            readable_token_records: DashMap::new(),
            writable_records: DashSet::new(),
            writable_token_records: DashMap::new(),
        })
    }

    /// The notification handle used to wake a blocked `select`.
    pub(crate) fn notifier(&self) -> Arc<Poller> {
        self.poller.clone()
    }

    /// # Errors
    /// if poll failed.
    pub(crate) fn select(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> std::io::Result<usize> {
        events.clear();
        self.poller.wait(events, timeout)
    }

    /// # Errors
    /// if add failed.
    pub(crate) fn add_read_event(&self, fd: c_int, token: usize) -> std::io::Result<()> {
        if self.readable_records.contains(&fd) {
            return Ok(());
        }
        if self.writable_records.contains(&fd) {
            //read and write interests on the same handle
            let interests = Event::all(token);
            self.reregister(fd, interests)
                .or_else(|_| self.register(fd, interests))
        } else {
            self.register(fd, Event::readable(token))
        }?;
        _ = self.readable_records.insert(fd);
        _ = self.readable_token_records.insert(fd, token);
        Ok(())
    }

    /// # Errors
    /// if add failed.
    pub(crate) fn add_write_event(&self, fd: c_int, token: usize) -> std::io::Result<()> {
        if self.writable_records.contains(&fd) {
            return Ok(());
        }
        if self.readable_records.contains(&fd) {
            //read and write interests on the same handle
            let interests = Event::all(token);
            self.reregister(fd, interests)
                .or_else(|_| self.register(fd, interests))
        } else {
            self.register(fd, Event::writable(token))
        }?;
        _ = self.writable_records.insert(fd);
        _ = self.writable_token_records.insert(fd, token);
        Ok(())
    }

    /// Re-arm the oneshot registration of `fd` with its recorded interests.
    ///
    /// # Errors
    /// if the modify failed.
    pub(crate) fn renew(&self, fd: c_int) -> std::io::Result<()> {
        let readable = self.readable_records.contains(&fd);
        let writable = self.writable_records.contains(&fd);
        if !readable && !writable {
            return Ok(());
        }
        let token = self
            .readable_token_records
            .get(&fd)
            .or_else(|| self.writable_token_records.get(&fd))
            .map_or(0, |r| *r.value());
        let interests = if readable && writable {
            Event::all(token)
        } else if readable {
            Event::readable(token)
        } else {
            Event::writable(token)
        };
        self.reregister(fd, interests)
    }

    fn register(&self, fd: c_int, interests: Event) -> std::io::Result<()> {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                let source = fd as std::os::windows::io::RawSocket;
            } else {
                let source = fd;
            }
        }
        unsafe { self.poller.add(source, interests) }
    }

    fn reregister(&self, fd: c_int, interests: Event) -> std::io::Result<()> {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                let source = unsafe {
                    std::os::windows::io::BorrowedSocket::borrow_raw(
                        fd as std::os::windows::io::RawSocket,
                    )
                };
            } else {
                let source = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            }
        }
        self.poller.modify(source, interests)
    }

    /// # Errors
    /// if delete failed.
    pub(crate) fn del_event(&self, fd: c_int) -> std::io::Result<()> {
        if self.readable_records.contains(&fd) || self.writable_records.contains(&fd) {
            self.deregister(fd)?;
            _ = self.readable_records.remove(&fd);
            _ = self.writable_records.remove(&fd);
            _ = self.readable_token_records.remove(&fd);
            _ = self.writable_token_records.remove(&fd);
        }
        Ok(())
    }

    /// # Errors
    /// if delete failed.
    ///
    /// # Panics
    /// if clean failed.
    pub(crate) fn del_read_event(&self, fd: c_int) -> std::io::Result<()> {
        if self.readable_records.contains(&fd) {
            if self.writable_records.contains(&fd) {
                //the write interest must survive
                let token = self
                    .writable_token_records
                    .get(&fd)
                    .map_or(0, |r| *r.value());
                self.reregister(fd, Event::writable(token))?;
                assert!(
                    self.readable_records.remove(&fd).is_some(),
                    "Clean readable_records failed !"
                );
                assert!(
                    self.readable_token_records.remove(&fd).is_some(),
                    "Clean readable_token_records failed !"
                );
            } else {
                self.del_event(fd)?;
            }
        }
        Ok(())
    }

    /// # Errors
    /// if delete failed.
    ///
    /// # Panics
    /// if clean failed.
    pub(crate) fn del_write_event(&self, fd: c_int) -> std::io::Result<()> {
        if self.writable_records.contains(&fd) {
            if self.readable_records.contains(&fd) {
                //the read interest must survive
                let token = self
                    .readable_token_records
                    .get(&fd)
                    .map_or(0, |r| *r.value());
                self.reregister(fd, Event::readable(token))?;
                assert!(
                    self.writable_records.remove(&fd).is_some(),
                    "Clean writable_records failed !"
                );
                assert!(
                    self.writable_token_records.remove(&fd).is_some(),
                    "Clean writable_token_records failed !"
                );
            } else {
                self.del_event(fd)?;
            }
        }
        Ok(())
    }

    fn deregister(&self, fd: c_int) -> std::io::Result<()> {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                let source = unsafe {
                    std::os::windows::io::BorrowedSocket::borrow_raw(
                        fd as std::os::windows::io::RawSocket,
                    )
                };
            } else {
                let source = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            }
        }
        self.poller.delete(source)
    }
}
