//! A counting semaphore with bulk token operations, used as the barrier
//! between the configurator and the worker pool.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A counting semaphore of fixed capacity that starts with zero tokens.
///
/// `acquire_n(k)` is `k` successive blocking single-token acquisitions and
/// `release_n(k)` is `k` releases. Releasing beyond capacity is a
/// programmer error and panics.
pub struct SemaphoreN {
    capacity: usize,
    tokens: Mutex<usize>,
    available: Condvar,
}

impl SemaphoreN {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tokens: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire one token, blocking until one is available.
    pub fn acquire(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        while *tokens == 0 {
            tokens = self.available.wait(tokens).unwrap();
        }
        *tokens -= 1;
    }

    /// Acquire `n` tokens, blocking for each in turn.
    pub fn acquire_n(&self, n: usize) {
        for _ in 0..n {
            self.acquire();
        }
    }

    /// Acquire one token, giving up once `cancelled` returns true.
    /// Returns whether a token was taken.
    pub fn acquire_interruptible(&self, cancelled: impl Fn() -> bool) -> bool {
        const POLL: Duration = Duration::from_millis(50);

        let mut tokens = self.tokens.lock().unwrap();
        loop {
            if *tokens > 0 {
                *tokens -= 1;
                return true;
            }
            if cancelled() {
                return false;
            }
            (tokens, _) = self.available.wait_timeout(tokens, POLL).unwrap();
        }
    }

    /// Acquire up to `n` tokens, giving up once `cancelled` returns true.
    /// Returns how many tokens were taken.
    pub fn acquire_n_interruptible(&self, n: usize, cancelled: impl Fn() -> bool) -> usize {
        for taken in 0..n {
            if !self.acquire_interruptible(&cancelled) {
                return taken;
            }
        }
        n
    }

    /// Release one token.
    pub fn release(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        assert!(
            *tokens < self.capacity,
            "semaphore released above its capacity of {}",
            self.capacity
        );
        *tokens += 1;
        self.available.notify_one();
    }

    /// Release `n` tokens.
    pub fn release_n(&self, n: usize) {
        for _ in 0..n {
            self.release();
        }
    }

    /// Take all currently available tokens without blocking. Returns how
    /// many were taken.
    pub fn drain(&self) -> usize {
        let mut tokens = self.tokens.lock().unwrap();
        std::mem::replace(&mut *tokens, 0)
    }
}
