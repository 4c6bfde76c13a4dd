//! Cancellation and exit signalling for background loops.
//!
//! `CancelToken` is the stop flag a loop polls once per iteration and sleeps on
//! between iterations, so a stop request interrupts the sleep instead of waiting
//! out the period. `ExitLatch` counts live loop threads; each thread holds an
//! `ExitGuard` that is released on return or panic, which lets a caller wait for
//! exit with a deadline (`JoinHandle::join` has none).

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::lock_recover;

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cv) = &*self.inner;
        *lock_recover(flag) = true;
        cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock_recover(&self.inner.0)
    }

    /// Sleep up to `period`. Returns `true` if cancelled before or during the sleep.
    pub fn sleep(&self, period: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let deadline = Instant::now() + period;
        let mut cancelled = lock_recover(flag);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match cv.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExitLatch {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

/// Held by a running loop thread. Dropping it marks the thread as exited.
#[derive(Debug)]
pub struct ExitGuard {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl ExitLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more live thread.
    pub fn enter(&self) -> ExitGuard {
        *lock_recover(&self.inner.0) += 1;
        ExitGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn live(&self) -> usize {
        *lock_recover(&self.inner.0)
    }

    /// Wait until every registered thread has exited. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (count, cv) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut live = lock_recover(count);
        while *live > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            live = match cv.wait_timeout(live, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let (count, cv) = &*self.inner;
        let mut live = lock_recover(count);
        *live = live.saturating_sub(1);
        cv.notify_all();
    }
}
