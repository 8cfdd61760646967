//! Stop signal for background runners.
//!
//! Runners loop on [`StopSignal::wait_timeout`] instead of sleeping so that a
//! stop request wakes them immediately.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop; wakes every waiter.
    pub fn stop(&self) {
        *self.inner.stopped.lock() = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Wait up to `duration`. Returns `true` when stop was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if !*stopped {
            self.inner.condvar.wait_for(&mut stopped, duration);
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_when_not_stopped() {
        let signal = StopSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_stop_wakes_waiter() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = waiter.wait_timeout(Duration::from_secs(10));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        signal.stop();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_already_stopped_returns_immediately() {
        let signal = StopSignal::new();
        signal.stop();
        assert!(signal.wait_timeout(Duration::from_secs(10)));
        assert!(signal.is_stopped());
    }
}
