#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    elided_lifetimes_in_paths,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,

    clippy::all,
    // clippy::restriction,
    clippy::pedantic,
    // clippy::nursery, // It's still under development
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::panic_in_result_fn,
    clippy::shadow_same, // Not too much bad
    clippy::shadow_reuse, // Not too much bad
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
    clippy::single_char_lifetime_names,
)]

//! A deadline-ordered queue of entries with handle-based cancellation.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Get the current process-monotonic time in ns.
///
/// The anchor is fixed at the first call, so readings never decrease.
#[must_use]
pub fn now() -> u64 {
    let anchor = *ANCHOR.get_or_init(Instant::now);
    u64::try_from(anchor.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Current monotonic time add `dur`, saturating at `u64::MAX`.
#[must_use]
pub fn get_timeout_time(dur: Duration) -> u64 {
    u64::try_from(dur.as_nanos())
        .map(|d| d.saturating_add(now()))
        .unwrap_or(u64::MAX)
}

#[derive(Debug)]
struct Node<T> {
    deadline: u64,
    value: T,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

#[allow(variant_size_differences)]
#[derive(Debug)]
enum Slot<T> {
    Vacant { next_free: Option<usize> },
    Occupied(Node<T>),
}

/// Identifies one pending entry of a `TimerQueue`.
///
/// A handle goes stale once its entry fires or is cancelled; using a stale
/// handle is harmless, `cancel` just reports a miss.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TimerHandle {
    index: usize,
    generation: u64,
}

/// A queue of entries kept in ascending deadline order.
///
/// Entries live in a slot arena threaded as a doubly-linked list, so a
/// `TimerHandle` unlinks its entry in O(1). Equal deadlines keep arrival
/// order.
#[derive(Debug)]
pub struct TimerQueue<T> {
    slots: Vec<Slot<T>>,
    free: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    generation: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        TimerQueue {
            slots: Vec::new(),
            free: None,
            head: None,
            tail: None,
            len: 0,
            generation: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    /// Returns the number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if there are no pending entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The earliest pending deadline, or `None` if the queue is empty.
    #[must_use]
    pub fn peek_deadline(&self) -> Option<u64> {
        self.head.map(|index| self.node(index).deadline)
    }

    /// Insert `value` at `deadline`, keeping the queue sorted.
    ///
    /// The two ends are compared first, so monotonically increasing or
    /// decreasing submission stays O(1); otherwise the walk starts from
    /// whichever end is numerically closer to `deadline`. An entry that ties
    /// an existing deadline lands after every entry already holding it.
    pub fn insert(&mut self, deadline: u64, value: T) -> TimerHandle {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let index = self.alloc(Node {
            deadline,
            value,
            generation,
            prev: None,
            next: None,
        });
        if let Some(tail) = self.tail {
            let head = self.head.expect("non-empty queue without a head");
            let head_deadline = self.node(head).deadline;
            let tail_deadline = self.node(tail).deadline;
            if deadline >= tail_deadline {
                self.link_after(tail, index);
            } else if deadline < head_deadline {
                self.link_before(head, index);
            } else if deadline - head_deadline <= tail_deadline - deadline {
                let mut cursor = head;
                while self.node(cursor).deadline <= deadline {
                    cursor = self.node(cursor).next.expect("walk ran past the tail");
                }
                self.link_before(cursor, index);
            } else {
                let mut cursor = tail;
                while self.node(cursor).deadline > deadline {
                    cursor = self.node(cursor).prev.expect("walk ran past the head");
                }
                self.link_after(cursor, index);
            }
        } else {
            self.head = Some(index);
            self.tail = Some(index);
        }
        self.len += 1;
        TimerHandle { index, generation }
    }

    /// Unlink the entry behind `handle` and return its value.
    ///
    /// Returns `None` if the handle is stale or was never a member; dropping
    /// the returned value runs the entry's destructors exactly once.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        match self.slots.get(handle.index) {
            Some(Slot::Occupied(node)) if node.generation == handle.generation => {}
            _ => return None,
        }
        Some(self.unlink(handle.index).value)
    }

    /// Remove and return the earliest entry if its deadline is `<= now`.
    pub fn pop_due(&mut self, now: u64) -> Option<(u64, T)> {
        let head = self.head?;
        if self.node(head).deadline > now {
            return None;
        }
        let node = self.unlink(head);
        Some((node.deadline, node.value))
    }

    /// Pop every entry with `deadline <= now` in ascending order, invoking
    /// `f` on each, and return the number popped.
    pub fn fire_due(&mut self, now: u64, mut f: impl FnMut(u64, T)) -> usize {
        let mut fired = 0;
        while let Some((deadline, value)) = self.pop_due(now) {
            f(deadline, value);
            fired += 1;
        }
        fired
    }

    /// Returns a front-to-back iterator over `(deadline, &value)` pairs.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    fn node(&self, index: usize) -> &Node<T> {
        match &self.slots[index] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => unreachable!("linked entry backed by a vacant slot"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        match &mut self.slots[index] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => unreachable!("linked entry backed by a vacant slot"),
        }
    }

    fn alloc(&mut self, node: Node<T>) -> usize {
        if let Some(index) = self.free {
            let next_free = match &self.slots[index] {
                Slot::Vacant { next_free } => *next_free,
                Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
            };
            self.free = next_free;
            self.slots[index] = Slot::Occupied(node);
            index
        } else {
            self.slots.push(Slot::Occupied(node));
            self.slots.len() - 1
        }
    }

    fn link_before(&mut self, at: usize, index: usize) {
        let prev = self.node(at).prev;
        {
            let node = self.node_mut(index);
            node.prev = prev;
            node.next = Some(at);
        }
        self.node_mut(at).prev = Some(index);
        match prev {
            Some(prev) => self.node_mut(prev).next = Some(index),
            None => self.head = Some(index),
        }
    }

    fn link_after(&mut self, at: usize, index: usize) {
        let next = self.node(at).next;
        {
            let node = self.node_mut(index);
            node.prev = Some(at);
            node.next = next;
        }
        self.node_mut(at).next = Some(index);
        match next {
            Some(next) => self.node_mut(next).prev = Some(index),
            None => self.tail = Some(index),
        }
    }

    fn unlink(&mut self, index: usize) -> Node<T> {
        let slot = std::mem::replace(
            &mut self.slots[index],
            Slot::Vacant {
                next_free: self.free,
            },
        );
        let Slot::Occupied(node) = slot else {
            unreachable!("unlink of a vacant slot")
        };
        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free = Some(index);
        self.len -= 1;
        node
    }
}

/// A front-to-back iterator over a `TimerQueue`.
#[derive(Debug, Copy, Clone)]
pub struct Iter<'q, T> {
    queue: &'q TimerQueue<T>,
    cursor: Option<usize>,
}

impl<'q, T> Iterator for Iter<'q, T> {
    type Item = (u64, &'q T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.queue.node(index);
        self.cursor = node.next;
        Some((node.deadline, &node.value))
    }
}
