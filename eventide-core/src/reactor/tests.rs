use super::*;
use crate::clock::{SystemClock, TestClock};
use crate::scheduler::SchedulerBuilder;

fn manual_reactor(clock: &Arc<TestClock>) -> Reactor {
    Reactor::new(None, clock.clone(), None).unwrap()
}

#[test]
fn idle_termination() {
    let clock = Arc::new(TestClock::auto_advance(0));
    let reactor = manual_reactor(&clock);
    let invoked = Arc::new(AtomicUsize::new(0));
    let count = Cell::new(1_i32);
    let hook_invoked = invoked.clone();
    reactor.on_idle(move |_| {
        _ = hook_invoked.fetch_add(1, Ordering::AcqRel);
        let before = count.get();
        count.set(before - 1);
        if before > 1 {
            HookResult::Continue
        } else {
            HookResult::Unregister
        }
    });
    assert_eq!(1, reactor.run(RunMode::Loop).unwrap());
    assert_eq!(1, invoked.load(Ordering::Acquire));
    // nothing is registered anymore, the loop has nothing to do
    assert_eq!(0, reactor.run(RunMode::Loop).unwrap());
}

#[test]
fn one_shot_fifo_and_priority() {
    let clock = Arc::new(TestClock::manual(0));
    let reactor = manual_reactor(&clock);
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = order.clone();
    let during_drain = order.clone();
    reactor.post(move |r| {
        first.lock().unwrap().push('a');
        // posted while draining: lands in the next batch
        r.post(move |_| during_drain.lock().unwrap().push('d'));
    });
    let second = order.clone();
    reactor.post(move |_| second.lock().unwrap().push('b'));
    let front = order.clone();
    reactor.post_priority(move |_| front.lock().unwrap().push('c'));
    assert_eq!(1, reactor.run(RunMode::NoWait).unwrap());
    assert_eq!(vec!['c', 'a', 'b'], *order.lock().unwrap());
    assert_eq!(1, reactor.run(RunMode::NoWait).unwrap());
    assert_eq!(vec!['c', 'a', 'b', 'd'], *order.lock().unwrap());
    assert_eq!(0, reactor.run(RunMode::NoWait).unwrap());
}

#[test]
fn timers_fire_in_deadline_order() {
    let clock = Arc::new(TestClock::manual(0));
    let reactor = manual_reactor(&clock);
    let fired = Arc::new(Mutex::new(Vec::new()));
    let late = fired.clone();
    let handle_100 = reactor.at(100, move |_| late.lock().unwrap().push(100_u64));
    let early = fired.clone();
    _ = reactor.at(50, move |_| early.lock().unwrap().push(50));
    let cancelled = fired.clone();
    let handle_75 = reactor.at(75, move |_| cancelled.lock().unwrap().push(75));
    assert_eq!(0, reactor.run(RunMode::NoWait).unwrap());
    clock.advance(60);
    assert_eq!(1, reactor.run(RunMode::NoWait).unwrap());
    assert!(reactor.cancel_timer(handle_75));
    assert!(!reactor.cancel_timer(handle_75), "handle must go stale");
    clock.advance(200);
    assert_eq!(1, reactor.run(RunMode::NoWait).unwrap());
    assert_eq!(vec![50, 100], *fired.lock().unwrap());
    assert!(!reactor.cancel_timer(handle_100), "fired handle must go stale");
}

#[test]
fn delay_uses_the_bound_clock() {
    let clock = Arc::new(TestClock::manual(1_000));
    let reactor = manual_reactor(&clock);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    _ = reactor.delay(Duration::from_nanos(500), move |_| {
        _ = counter.fetch_add(1, Ordering::AcqRel);
    });
    clock.advance(1_499);
    assert_eq!(0, reactor.run(RunMode::NoWait).unwrap());
    clock.advance(1_500);
    assert_eq!(1, reactor.run(RunMode::NoWait).unwrap());
    assert_eq!(1, fired.load(Ordering::Acquire));
}

#[test]
fn prepare_hooks_run_every_iteration() {
    let clock = Arc::new(TestClock::manual(0));
    let reactor = manual_reactor(&clock);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    reactor.on_prepare(move |_| {
        _ = counter.fetch_add(1, Ordering::AcqRel);
        HookResult::Continue
    });
    let once = Arc::new(AtomicUsize::new(0));
    let once_counter = once.clone();
    reactor.on_prepare(move |_| {
        _ = once_counter.fetch_add(1, Ordering::AcqRel);
        HookResult::Unregister
    });
    assert_eq!(0, reactor.run(RunMode::NoWait).unwrap());
    assert_eq!(0, reactor.run(RunMode::NoWait).unwrap());
    assert_eq!(2, runs.load(Ordering::Acquire));
    assert_eq!(1, once.load(Ordering::Acquire), "unregistered after one run");
}

#[test]
fn stop_honored_at_next_iteration_top() {
    let clock = Arc::new(TestClock::manual(0));
    let reactor = manual_reactor(&clock);
    reactor.on_idle(|_| HookResult::Continue);
    reactor.post(|r| r.stop());
    // the stop lands mid-iteration and is honored at the next top
    assert_eq!(1, reactor.run(RunMode::Loop).unwrap());
    assert_eq!(ReactorState::Stopped, reactor.get_state());
    // the flag was consumed, the reactor is reusable
    assert_eq!(1, reactor.run(RunMode::Once).unwrap());
}

#[test]
fn cross_thread_task_handoff() {
    let scheduler = SchedulerBuilder::new()
        .groups(2)
        .threads_per_group(2)
        .build()
        .unwrap();
    let reactor = Reactor::new(None, Arc::new(SystemClock::default()), Some(scheduler)).unwrap();
    let body_runs = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));
    let body_counter = body_runs.clone();
    let completion_counter = completions.clone();
    let loop_thread = std::thread::current().id();
    let task = reactor
        .submit(
            None,
            move |param| {
                _ = body_counter.fetch_add(1, Ordering::AcqRel);
                param.map(|p| p + 1)
            },
            move |_, result| {
                assert_eq!(
                    loop_thread,
                    std::thread::current().id(),
                    "completion escaped the loop thread"
                );
                assert_eq!(Ok(Some(42)), result);
                _ = completion_counter.fetch_add(1, Ordering::AcqRel);
            },
            Some(41),
            1,
            &[],
        )
        .unwrap();
    assert!(reactor.run(RunMode::Loop).unwrap() >= 1);
    assert!(task.has_ran());
    assert_eq!(1, body_runs.load(Ordering::Acquire));
    assert_eq!(1, completions.load(Ordering::Acquire));
    assert_eq!(0, reactor.remote().inflight_tasks());
}

#[test]
fn submit_with_dependencies() {
    let scheduler = SchedulerBuilder::new().groups(2).build().unwrap();
    let reactor = Reactor::new(None, Arc::new(SystemClock::default()), Some(scheduler)).unwrap();
    let violations = Arc::new(AtomicUsize::new(0));
    let first = reactor
        .submit(Some(String::from("first")), |p| p, |_, _| {}, None, 0, &[])
        .unwrap();
    let watched = first.clone();
    let seen = violations.clone();
    _ = reactor
        .submit(
            Some(String::from("second")),
            move |p| {
                if !watched.has_ran() {
                    _ = seen.fetch_add(1, Ordering::AcqRel);
                }
                p
            },
            |_, result| assert_eq!(Ok(None), result),
            None,
            1,
            &[first],
        )
        .unwrap();
    assert!(reactor.run(RunMode::Loop).unwrap() >= 1);
    assert_eq!(0, violations.load(Ordering::Acquire));
}

#[test]
fn submit_without_scheduler_is_refused() {
    let clock = Arc::new(TestClock::manual(0));
    let reactor = manual_reactor(&clock);
    let error = reactor
        .submit(None, |p| p, |_, _| {}, None, 0, &[])
        .unwrap_err();
    assert_eq!(ErrorKind::Unsupported, error.kind());
}

#[cfg(unix)]
#[test]
fn pipe_readability_dispatch() {
    let mut fds: [c_int; 2] = [0; 2];
    assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
    let (read_fd, write_fd) = (fds[0], fds[1]);
    let clock = Arc::new(TestClock::manual(0));
    let reactor = manual_reactor(&clock);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    reactor
        .add_read_event(read_fd, move |_| {
            let mut buf = [0_u8; 16];
            let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            let n = usize::try_from(n).expect("pipe read failed");
            sink.lock().unwrap().extend_from_slice(&buf[..n]);
            HookResult::Unregister
        })
        .unwrap();
    assert_eq!(3, unsafe {
        libc::write(write_fd, b"hey".as_ptr().cast(), 3)
    });
    assert_eq!(1, reactor.run(RunMode::Once).unwrap());
    assert_eq!(b"hey".to_vec(), *received.lock().unwrap());
    // the handler unregistered itself, nothing is watched anymore
    assert_eq!(0, reactor.run(RunMode::NoWait).unwrap());
    unsafe {
        _ = libc::close(read_fd);
        _ = libc::close(write_fd);
    }
}

#[cfg(unix)]
#[test]
fn reader_stays_registered_on_continue() {
    let mut fds: [c_int; 2] = [0; 2];
    assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
    let (read_fd, write_fd) = (fds[0], fds[1]);
    let clock = Arc::new(TestClock::manual(0));
    let reactor = manual_reactor(&clock);
    let chunks = Arc::new(AtomicUsize::new(0));
    let counter = chunks.clone();
    reactor
        .add_read_event(read_fd, move |_| {
            let mut buf = [0_u8; 16];
            _ = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            _ = counter.fetch_add(1, Ordering::AcqRel);
            HookResult::Continue
        })
        .unwrap();
    assert_eq!(1, unsafe { libc::write(write_fd, b"x".as_ptr().cast(), 1) });
    assert_eq!(1, reactor.run(RunMode::Once).unwrap());
    assert_eq!(1, unsafe { libc::write(write_fd, b"y".as_ptr().cast(), 1) });
    assert_eq!(1, reactor.run(RunMode::Once).unwrap());
    assert_eq!(2, chunks.load(Ordering::Acquire));
    reactor.del_event(read_fd).unwrap();
    assert_eq!(0, reactor.run(RunMode::NoWait).unwrap());
    unsafe {
        _ = libc::close(read_fd);
        _ = libc::close(write_fd);
    }
}
