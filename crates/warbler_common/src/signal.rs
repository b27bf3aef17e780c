//! Cancellable wait used by background timers.
//!
//! A thread parks in `wait_timeout()` and is woken as soon as another thread
//! calls `cancel()`, instead of sleeping out the full interval.
//!
//! # Usage
//! ```ignore
//! let signal = CancelSignal::new();
//! let remote = signal.clone();
//!
//! std::thread::spawn(move || {
//!     if !remote.wait_timeout(Duration::from_millis(500)) {
//!         // deadline passed without cancellation
//!     }
//! });
//!
//! signal.cancel(); // wakes the waiter immediately
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot cancellation flag with a condvar for prompt wakeup.
///
/// The flag lives under the mutex, so a `cancel()` racing with a waiter that
/// is about to park is never lost.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Cancel. Wakes all waiters immediately; idempotent.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Block for at most `duration`. Returns `true` if cancelled (caller
    /// should not act), `false` once the full duration has elapsed.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .condvar
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }
        *cancelled
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
