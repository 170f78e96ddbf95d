use std::fmt::{Debug, Display, Formatter};

/// Enums used to describe how `Reactor::run` drives its iterations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunMode {
    /// Repeat iterations until `stop()` is observed or no work source remains.
    Loop,
    /// Exactly one pass over the iteration steps.
    Once,
    /// Like `Once`, but the poll step never blocks.
    NoWait,
}

impl Display for RunMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Returned by prepare/idle/readiness callbacks to control re-registration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HookResult {
    /// Keep the callback registered for the next occasion.
    Continue,
    /// Drop the callback after this invocation.
    Unregister,
}

impl Display for HookResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Enums used to describe reactor state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReactorState {
    ///The reactor is between iterations.
    Idle,
    ///The reactor is running its prepare hooks.
    Preparing,
    ///The reactor is waiting for I/O readiness.
    Polling,
    ///The reactor is dispatching callbacks.
    Dispatching,
    ///The reactor observed its stop flag.
    Stopped,
}

impl Display for ReactorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Enums used to describe scheduler state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SchedulerState {
    ///The scheduler is created.
    Created,
    ///The scheduler accepts and runs tasks.
    Running,
    ///The scheduler refuses new tasks, workers exit after the task in flight.
    Stopping,
    ///All worker threads have been joined.
    Stopped,
}

impl Display for SchedulerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Advance policy of a `TestClock`, fixed at construction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AdvancePolicy {
    /// `wait_until` blocks until an external `advance` reaches the deadline.
    Manual,
    /// `wait_until` jumps the clock to the deadline and returns at once.
    Auto,
}

impl Display for AdvancePolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
