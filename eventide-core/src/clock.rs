use crate::common::Named;
use crate::constants::AdvancePolicy;
use std::fmt::Debug;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A monotonic time source shared by the reactor, its timers and tests.
pub trait Clock: Debug + Named + Send + Sync {
    /// Current reading in ns. Never decreases.
    fn now(&self) -> u64;

    /// Block the calling thread until the clock reads at least `deadline`,
    /// returning the observed time.
    fn wait_until(&self, deadline: u64) -> u64;

    /// Current reading add `dur`, saturating at `u64::MAX`.
    fn timeout_time(&self, dur: Duration) -> u64 {
        u64::try_from(dur.as_nanos())
            .map(|d| d.saturating_add(self.now()))
            .unwrap_or(u64::MAX)
    }
}

/// const `SYSTEM_CLOCK_NAME`.
pub const SYSTEM_CLOCK_NAME: &str = "SystemClock";

/// Wraps the OS monotonic clock, reading 0 at process anchor time.
#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock {}

impl Named for SystemClock {
    fn get_name(&self) -> &str {
        SYSTEM_CLOCK_NAME
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        eventide_timer::now()
    }

    fn wait_until(&self, deadline: u64) -> u64 {
        loop {
            let now = self.now();
            if now >= deadline {
                return now;
            }
            // sleep may wake early, the loop re-checks
            std::thread::sleep(Duration::from_nanos(deadline - now));
        }
    }
}

/// const `TEST_CLOCK_NAME`.
pub const TEST_CLOCK_NAME: &str = "TestClock";

/// A virtual clock advanced by hand, for deterministic tests.
#[derive(Debug)]
pub struct TestClock {
    policy: AdvancePolicy,
    now: Mutex<u64>,
    advanced: Condvar,
}

impl TestClock {
    /// Create a manually advanced clock starting at `start`.
    #[must_use]
    pub fn manual(start: u64) -> Self {
        TestClock {
            policy: AdvancePolicy::Manual,
            now: Mutex::new(start),
            advanced: Condvar::new(),
        }
    }

    /// Create an auto-advancing clock starting at `start`.
    #[must_use]
    pub fn auto_advance(start: u64) -> Self {
        TestClock {
            policy: AdvancePolicy::Auto,
            now: Mutex::new(start),
            advanced: Condvar::new(),
        }
    }

    /// Get the advance policy fixed at construction.
    #[must_use]
    pub fn get_policy(&self) -> AdvancePolicy {
        self.policy
    }

    /// Move the clock forward to `timestamp` and wake every waiter.
    ///
    /// # Panics
    /// if `timestamp` is behind the current reading, the clock would stop
    /// being monotonic.
    pub fn advance(&self, timestamp: u64) {
        let mut now = self.now.lock().unwrap();
        assert!(
            *now <= timestamp,
            "clock moved backwards: {} -> {timestamp}",
            *now
        );
        *now = timestamp;
        self.advanced.notify_all();
    }

    /// Move the clock forward by `dur` and wake every waiter.
    pub fn advance_by(&self, dur: Duration) {
        let delta = u64::try_from(dur.as_nanos()).unwrap_or(u64::MAX);
        let mut now = self.now.lock().unwrap();
        *now = now.saturating_add(delta);
        self.advanced.notify_all();
    }
}

impl Named for TestClock {
    fn get_name(&self) -> &str {
        TEST_CLOCK_NAME
    }
}

impl Clock for TestClock {
    fn now(&self) -> u64 {
        *self.now.lock().unwrap()
    }

    fn wait_until(&self, deadline: u64) -> u64 {
        let mut now = self.now.lock().unwrap();
        match self.policy {
            AdvancePolicy::Auto => {
                if *now < deadline {
                    *now = deadline;
                    self.advanced.notify_all();
                }
                *now
            }
            AdvancePolicy::Manual => {
                while *now < deadline {
                    now = self.advanced.wait(now).unwrap();
                }
                *now
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::default();
        let mut last = clock.now();
        for _ in 0..100 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn system_clock_wait_until() {
        let clock = SystemClock::default();
        let deadline = clock.timeout_time(Duration::from_millis(5));
        assert!(clock.wait_until(deadline) >= deadline);
    }

    #[test]
    fn auto_advance_jumps() {
        let clock = TestClock::auto_advance(0);
        assert_eq!(AdvancePolicy::Auto, clock.get_policy());
        assert_eq!(1_000_000, clock.wait_until(1_000_000));
        assert_eq!(1_000_000, clock.now());
        // already satisfied deadlines do not move the clock back
        assert_eq!(1_000_000, clock.wait_until(999));
    }

    #[test]
    fn manual_advance_wakes_waiter() {
        let clock = Arc::new(TestClock::manual(0));
        let waiter = clock.clone();
        let handle = std::thread::Builder::new()
            .name("clock-waiter".to_string())
            .spawn(move || waiter.wait_until(500))
            .expect("failed to spawn thread");
        // an early advance must not release the waiter
        clock.advance(100);
        clock.advance(750);
        assert_eq!(750, handle.join().unwrap());
        assert_eq!(750, clock.now());
    }

    #[test]
    #[should_panic(expected = "clock moved backwards")]
    fn manual_advance_backwards_is_fatal() {
        let clock = TestClock::manual(100);
        clock.advance(99);
    }
}
