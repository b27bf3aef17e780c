//! One-shot fallback timer.
//!
//! Guarantees a pending batch is flushed even if no further submissions
//! arrive. The timer runs on its own named thread and parks on a
//! [`CancelSignal`]; `cancel()` wakes it so it exits without firing.

use std::thread::JoinHandle;
use std::time::Duration;

use warbler_common::signal::CancelSignal;

pub struct FallbackTimer {
    signal: CancelSignal,
    handle: Option<JoinHandle<()>>,
}

impl FallbackTimer {
    /// Arm a timer that runs `on_fire` after `delay` unless cancelled first.
    pub fn start<F>(delay: Duration, on_fire: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let signal = CancelSignal::new();
        let remote = signal.clone();
        let handle = std::thread::Builder::new()
            .name("warbler-fallback-flush".into())
            .spawn(move || {
                if remote.wait_timeout(delay) {
                    tracing::trace!("fallback timer cancelled before firing");
                    return;
                }
                on_fire();
            })?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stop the timer if it has not fired yet. Never blocks: the callback may
    /// be waiting on the lock the caller holds.
    pub fn cancel(mut self) {
        self.signal.cancel();
        // detach
        drop(self.handle.take());
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// True once the timer thread has exited (fired or cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for FallbackTimer {
    fn drop(&mut self) {
        self.signal.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn wait_for(flag: &AtomicBool, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        flag.load(Ordering::SeqCst)
    }

    #[test]
    fn test_timer_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let timer = FallbackTimer::start(Duration::from_millis(10), move || {
            f.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(wait_for(&fired, Duration::from_secs(5)));
        assert!(!timer.is_cancelled());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let timer = FallbackTimer::start(Duration::from_millis(200), move || {
            f.store(true, Ordering::SeqCst);
        })
        .unwrap();
        timer.cancel();
        assert!(!wait_for(&fired, Duration::from_millis(400)));
    }

    #[test]
    fn test_drop_cancels() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        drop(
            FallbackTimer::start(Duration::from_millis(100), move || {
                f.store(true, Ordering::SeqCst);
            })
            .unwrap(),
        );
        assert!(!wait_for(&fired, Duration::from_millis(300)));
    }
}
