//! Counting semaphore used as an admission gate.
//!
//! Uses `Mutex + Condvar` from std; the lock is only held to adjust the count.

use std::sync::{Condvar, Mutex};

/// A counting semaphore that limits concurrent access to a shared resource.
///
/// Closing the semaphore wakes every waiter and makes further acquires fail,
/// which lets a blocked producer notice that the run is over.
pub struct Semaphore {
    permits: usize,
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    available: usize,
    closed: bool,
}

/// RAII guard that releases one permit on drop.
pub struct SemaphoreGuard<'a>(&'a Semaphore);

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.permits)
            .field("available", &self.available())
            .finish()
    }
}

impl Semaphore {
    /// Create a semaphore with `permits` initial permits (at least one).
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            permits,
            state: Mutex::new(State {
                available: permits,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then acquire it.
    ///
    /// `None` once the semaphore is closed.
    pub fn acquire(&self) -> Option<SemaphoreGuard<'_>> {
        self.acquire_permit().then_some(SemaphoreGuard(self))
    }

    /// Acquire without a guard. Pair with [`release`](Self::release),
    /// possibly from another thread. Returns `false` if closed.
    pub fn acquire_permit(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.available == 0 && !state.closed {
            state = self.cond.wait(state).unwrap();
        }
        if state.closed {
            return false;
        }
        state.available -= 1;
        true
    }

    /// Return one permit taken by [`acquire_permit`](Self::acquire_permit).
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.available = (state.available + 1).min(self.permits);
        self.cond.notify_one();
    }

    /// Fail all current and future acquires.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.state.lock().unwrap().available
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.permits - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.permits
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}
