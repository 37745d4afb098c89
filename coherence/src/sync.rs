//! Small synchronization primitives used across the engine
//!
//! Fault handlers park on a [`Completion`] while another fault owns the same
//! page, and transaction issuers back off with [`Backoff`] when a bounded
//! resource is momentarily exhausted. Both are plain atomics so they work the
//! same on bare metal and in host-side tests.

use core::hint;
use core::sync::atomic::{AtomicBool, Ordering};

/// One-shot completion signal.
///
/// A waiter spins until another thread calls [`Completion::complete`]. The
/// signal is never reset; a new rendezvous allocates a new completion.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Signal all current and future waiters.
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Spin until the completion is signaled.
    pub fn wait(&self) {
        let mut backoff = Backoff::new();
        while !self.done.load(Ordering::Acquire) {
            backoff.snooze();
        }
    }
}

/// Bounded exponential spin backoff for retry loops.
pub struct Backoff {
    step: u32,
}

/// Spin count doubles each step up to `1 << MAX_STEP`.
const MAX_STEP: u32 = 10;

impl Backoff {
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Busy-wait for the current step, then widen the next one.
    pub fn snooze(&mut self) {
        for _ in 0..(1u32 << self.step) {
            hint::spin_loop();
        }
        if self.step < MAX_STEP {
            self.step += 1;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
