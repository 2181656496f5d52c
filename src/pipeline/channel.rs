//! Bounded hand-off channel between two adjacent stations.
//!
//! The channel is built from two counting resources, free slots and available
//! items, plus a FIFO queue behind a mutex that is held only for the
//! enqueue/dequeue instant. Producers wait on free slots, consumers wait on
//! items, so the two sides block independently and a release wakes exactly
//! the waiter class that can make progress.
//!
//! Waits are bounded by a timeout and can additionally be cut short by:
//!
//! - [`BoundedChannel::stop`], irreversible, fails every current and future call;
//! - a caller-supplied cancellation predicate, re-checked whenever
//!   [`BoundedChannel::interrupt`] wakes the waiters. Stations use this to stop
//!   or pause promptly without destroying a channel that is still wired.

use crate::pipeline::error::{PopError, PushError};
use crate::pipeline::lock;
use crate::types::Product;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// The channel type wired between stations.
pub type ProductChannel = BoundedChannel<Product>;

#[derive(Clone, Copy)]
enum Wait {
    /// Fail immediately if no permit is available.
    None,
    Until(Instant),
    Forever,
}

impl Wait {
    fn for_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Wait::Until(deadline),
            None => Wait::Forever,
        }
    }
}

enum Acquire {
    Acquired,
    TimedOut,
    Stopped,
    Cancelled,
}

/// A counting resource.
struct Permits {
    count: Mutex<usize>,
    available: Condvar,
}

impl Permits {
    fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    fn acquire(&self, wait: Wait, stopping: &AtomicBool, cancel: &dyn Fn() -> bool) -> Acquire {
        let mut count = lock(&self.count);
        loop {
            if stopping.load(Ordering::Acquire) {
                return Acquire::Stopped;
            }
            if *count > 0 {
                *count -= 1;
                return Acquire::Acquired;
            }
            if cancel() {
                return Acquire::Cancelled;
            }
            count = match wait {
                Wait::None => return Acquire::TimedOut,
                Wait::Forever => self
                    .available
                    .wait(count)
                    .unwrap_or_else(PoisonError::into_inner),
                Wait::Until(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Acquire::TimedOut;
                    }
                    self.available
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn release(&self) {
        *lock(&self.count) += 1;
        self.available.notify_one();
    }

    fn reset(&self, count: usize) {
        *lock(&self.count) = count;
        self.available.notify_all();
    }

    /// Wake every waiter so it re-checks the stop flag and its cancel predicate.
    fn wake_all(&self) {
        let _count = lock(&self.count);
        self.available.notify_all();
    }

    fn available(&self) -> usize {
        *lock(&self.count)
    }
}

/// Fixed-capacity, thread-safe FIFO hand-off.
///
/// A capacity of zero is treated as one.
pub struct BoundedChannel<T> {
    queue: Mutex<VecDeque<T>>,
    free_slots: Permits,
    items: Permits,
    capacity: usize,
    stopping: AtomicBool,
}

impl<T> BoundedChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            free_slots: Permits::new(capacity),
            items: Permits::new(0),
            capacity,
            stopping: AtomicBool::new(false),
        }
    }

    // ── Producer side ──

    /// Block until a slot is free, the timeout elapses, or the channel stops.
    pub fn push(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        self.push_inner(item, Wait::for_timeout(timeout), &|| false, || Some(()))
    }

    /// Like [`push`](Self::push), but also gives up with `Cancelled` once
    /// `cancel` returns true. The predicate is re-checked on every wake-up,
    /// including those caused by [`interrupt`](Self::interrupt).
    pub fn push_until(
        &self,
        item: T,
        timeout: Duration,
        cancel: impl Fn() -> bool,
    ) -> Result<(), PushError<T>> {
        self.push_inner(item, Wait::for_timeout(timeout), &cancel, || Some(()))
    }

    /// Like [`push_until`](Self::push_until), with `enter` called once a slot
    /// is reserved and before the item is enqueued. The guard it returns is
    /// handed back on success so the caller can finish its own bookkeeping
    /// before anyone else observes the enqueue. Returning `None` gives up
    /// with `Cancelled` and frees the slot.
    pub fn push_guarded<G>(
        &self,
        item: T,
        timeout: Duration,
        cancel: impl Fn() -> bool,
        enter: impl FnOnce() -> Option<G>,
    ) -> Result<G, PushError<T>> {
        self.push_inner(item, Wait::for_timeout(timeout), &cancel, enter)
    }

    /// Non-blocking push; fails with `Full` if no slot is free right now.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        self.push_inner(item, Wait::None, &|| false, || Some(()))
    }

    /// Non-blocking [`push_guarded`](Self::push_guarded).
    pub fn try_push_guarded<G>(
        &self,
        item: T,
        enter: impl FnOnce() -> Option<G>,
    ) -> Result<G, PushError<T>> {
        self.push_inner(item, Wait::None, &|| false, enter)
    }

    fn push_inner<G>(
        &self,
        item: T,
        wait: Wait,
        cancel: &dyn Fn() -> bool,
        enter: impl FnOnce() -> Option<G>,
    ) -> Result<G, PushError<T>> {
        if self.is_stopped() {
            return Err(PushError::Stopped(item));
        }

        match self.free_slots.acquire(wait, &self.stopping, cancel) {
            Acquire::Acquired => {}
            Acquire::TimedOut => {
                return Err(match wait {
                    Wait::None => PushError::Full(item),
                    _ => PushError::Timeout(item),
                });
            }
            Acquire::Stopped => return Err(PushError::Stopped(item)),
            Acquire::Cancelled => return Err(PushError::Cancelled(item)),
        }

        let Some(guard) = enter() else {
            self.free_slots.release();
            return Err(PushError::Cancelled(item));
        };

        {
            let mut queue = lock(&self.queue);
            if self.is_stopped() {
                drop(queue);
                self.free_slots.release();
                return Err(PushError::Stopped(item));
            }
            queue.push_back(item);
        }

        self.items.release();
        Ok(guard)
    }

    // ── Consumer side ──

    /// Block until an item is available, the timeout elapses, or the channel
    /// stops. Returns the oldest item.
    pub fn pop(&self, timeout: Duration) -> Result<T, PopError> {
        self.pop_inner(Wait::for_timeout(timeout), &|| false, || Some(()))
            .map(|(item, ())| item)
    }

    /// Like [`pop`](Self::pop) with a cancellation predicate.
    pub fn pop_until(&self, timeout: Duration, cancel: impl Fn() -> bool) -> Result<T, PopError> {
        self.pop_inner(Wait::for_timeout(timeout), &cancel, || Some(()))
            .map(|(item, ())| item)
    }

    /// Like [`pop_until`](Self::pop_until), with `enter` called once an item is
    /// reserved and before it is dequeued. See [`push_guarded`](Self::push_guarded).
    pub fn pop_guarded<G>(
        &self,
        timeout: Duration,
        cancel: impl Fn() -> bool,
        enter: impl FnOnce() -> Option<G>,
    ) -> Result<(T, G), PopError> {
        self.pop_inner(Wait::for_timeout(timeout), &cancel, enter)
    }

    /// Non-blocking pop; fails with `Empty` if nothing is queued right now.
    pub fn try_pop(&self) -> Result<T, PopError> {
        self.pop_inner(Wait::None, &|| false, || Some(()))
            .map(|(item, ())| item)
    }

    fn pop_inner<G>(
        &self,
        wait: Wait,
        cancel: &dyn Fn() -> bool,
        enter: impl FnOnce() -> Option<G>,
    ) -> Result<(T, G), PopError> {
        if self.is_stopped() {
            return Err(PopError::Stopped);
        }

        match self.items.acquire(wait, &self.stopping, cancel) {
            Acquire::Acquired => {}
            Acquire::TimedOut => {
                return Err(match wait {
                    Wait::None => PopError::Empty,
                    _ => PopError::Timeout,
                });
            }
            Acquire::Stopped => return Err(PopError::Stopped),
            Acquire::Cancelled => return Err(PopError::Cancelled),
        }

        let Some(guard) = enter() else {
            self.items.release();
            return Err(PopError::Cancelled);
        };

        let item = {
            let mut queue = lock(&self.queue);
            if self.is_stopped() {
                drop(queue);
                self.items.release();
                return Err(PopError::Stopped);
            }
            queue.pop_front()
        };

        match item {
            Some(item) => {
                self.free_slots.release();
                Ok((item, guard))
            }
            // Only reachable if `clear` raced with this pop
            None => Err(PopError::Empty),
        }
    }

    // ── Status ──

    pub fn size(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    pub fn is_full(&self) -> bool {
        lock(&self.queue).len() >= self.capacity
    }

    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Free slots currently available to producers.
    pub fn free_slots(&self) -> usize {
        self.free_slots.available()
    }

    // ── Lifecycle ──

    /// Stop the channel. Idempotent and irreversible: every blocked call
    /// returns failure and every later call fails immediately.
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            tracing::trace!("Channel stopped ({} items left queued)", self.size());
        }
        self.free_slots.wake_all();
        self.items.wake_all();
    }

    /// Wake all blocked callers so they re-check their cancellation predicate.
    /// Does not change the channel's state.
    pub fn interrupt(&self) {
        self.free_slots.wake_all();
        self.items.wake_all();
    }

    /// Discard all queued items and restore the full capacity. Returns the
    /// number of items discarded.
    ///
    /// Must not race with blocked push/pop calls; intended for a full reset
    /// while both endpoints are stopped.
    pub fn clear(&self) -> usize {
        let mut queue = lock(&self.queue);
        let discarded = queue.len();
        queue.clear();
        self.free_slots.reset(self.capacity);
        self.items.reset(0);
        discarded
    }
}

impl<T> std::fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
