//! Background thread that periodically drives supervision passes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tabula_common::shutdown::StopSignal;
use tabula_common::{TabulaError, TabulaResult};

/// Anything with time-driven control work: cells, or a whole cluster.
pub trait Supervised: Send + Sync {
    fn supervise(&self, now: Instant);
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub name: String,
    pub interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: "tabula-supervisor".to_string(),
            interval: Duration::from_millis(500),
        }
    }
}

/// Handle returned by [`Supervisor::start`]. Dropping it stops the thread.
pub struct SupervisorHandle {
    signal: StopSignal,
    join_handle: Option<std::thread::JoinHandle<()>>,
    passes: Arc<AtomicU64>,
}

impl SupervisorHandle {
    pub fn stop(&self) {
        self.signal.stop();
    }

    pub fn stop_and_join(mut self) {
        self.signal.stop();
        if let Some(h) = self.join_handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.signal.is_stopped()
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.signal.stop();
    }
}

pub struct Supervisor;

impl Supervisor {
    /// Spawn the supervision thread. Fails (without panicking) when the OS
    /// refuses to spawn a thread.
    pub fn start(config: SupervisorConfig, target: Arc<dyn Supervised>) -> TabulaResult<SupervisorHandle> {
        let signal = StopSignal::new();
        let thread_signal = signal.clone();
        let passes = Arc::new(AtomicU64::new(0));
        let thread_passes = passes.clone();
        let interval = config.interval;
        let name = config.name.clone();

        let join_handle = std::thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                tracing::info!(name = %name, interval_ms = interval.as_millis() as u64, "supervisor started");
                while !thread_signal.wait_timeout(interval) {
                    target.supervise(Instant::now());
                    thread_passes.fetch_add(1, Ordering::Relaxed);
                }
                tracing::info!(name = %name, "supervisor stopped");
            })
            .map_err(|e| {
                tracing::error!(component = %config.name, error = %e, "failed to spawn supervisor thread");
                TabulaError::internal(format!("failed to spawn {} thread: {e}", config.name))
            })?;

        Ok(SupervisorHandle {
            signal,
            join_handle: Some(join_handle),
            passes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Count(AtomicU64);

    impl Supervised for Count {
        fn supervise(&self, _now: Instant) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_supervisor_runs_until_stopped() {
        let target = Arc::new(Count(AtomicU64::new(0)));
        let handle = Supervisor::start(
            SupervisorConfig {
                name: "test-supervisor".into(),
                interval: Duration::from_millis(5),
            },
            target.clone(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(handle.is_running());
        handle.stop_and_join();
        let after = target.0.load(Ordering::Relaxed);
        assert!(after > 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(target.0.load(Ordering::Relaxed), after);
    }
}
