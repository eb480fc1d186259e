//! Completion signals between the dispatch loop and blocked callers.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-slot semaphore carrying a value.
///
/// The dispatch loop posts the acknowledgement it received (CONNACK,
/// SUBACK, UNSUBACK); the caller blocked in the matching public operation
/// takes it. A second post before the first is taken overwrites it.
#[derive(Debug)]
pub struct Signal<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self, value: T) {
        *self.slot.lock() = Some(value);
        self.cond.notify_all();
    }

    /// Take the value without blocking.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Block until a value is posted or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }

    /// Drop any value nobody collected.
    pub fn clear(&self) {
        self.slot.lock().take();
    }
}

/// Condition variable without a payload, used to wake every waiter after a
/// state change they poll for themselves (delivery completion, drained
/// registries).
#[derive(Debug, Default)]
pub struct Notify {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    /// Block until the next `notify` or `timeout`.
    pub fn wait(&self, timeout: Duration) {
        let mut generation = self.generation.lock();
        let seen = *generation;
        let deadline = Instant::now() + timeout;
        while *generation == seen {
            if self.cond.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
    }
}
