//! Periodic leak sweeps on a background thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::closeable::{CloseCell, Closeable, QueryCloseable};
use crate::error::ResourceResult;
use crate::leak::{self, LeakRegistry};

#[derive(Debug, Default)]
struct WatchdogCounters {
    sweeps: AtomicU64,
    leaks: AtomicU64,
}

/// Sweeps a [`LeakRegistry`] at a fixed interval until closed or dropped.
#[derive(Debug)]
pub struct LeakWatchdog {
    cell: CloseCell,
    interval: Duration,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<WatchdogCounters>,
}

impl LeakWatchdog {
    /// Start sweeping `registry` every `interval`.
    pub fn start(registry: Arc<LeakRegistry>, interval: Duration) -> ResourceResult<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let counters = Arc::new(WatchdogCounters::default());
        let thread_counters = Arc::clone(&counters);

        let handle = thread::Builder::new()
            .name("tether-leak-watchdog".into())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let report = registry.sweep();
                            thread_counters.sweeps.fetch_add(1, Ordering::Relaxed);
                            thread_counters
                                .leaks
                                .fetch_add(report.leaks.len() as u64, Ordering::Relaxed);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        tracing::debug!(target: "tether::leak", ?interval, "leak watchdog started");
        Ok(Self {
            cell: CloseCell::untracked("LeakWatchdog"),
            interval,
            stop: Mutex::new(Some(stop)),
            handle: Mutex::new(Some(handle)),
            counters,
        })
    }

    /// Start a watchdog on the global registry if a sweep interval is configured.
    pub fn from_config() -> ResourceResult<Option<Self>> {
        match crate::config().sweep.interval {
            Some(interval) => Ok(Some(Self::start(Arc::clone(leak::registry()), interval)?)),
            None => Ok(None),
        }
    }

    /// Sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweeps completed so far.
    pub fn sweeps(&self) -> u64 {
        self.counters.sweeps.load(Ordering::Relaxed)
    }

    /// Leaks found so far.
    pub fn leaks_found(&self) -> u64 {
        self.counters.leaks.load(Ordering::Relaxed)
    }
}

impl QueryCloseable for LeakWatchdog {
    fn is_closed(&self) -> bool {
        self.cell.is_closed()
    }

    fn is_closing(&self) -> bool {
        self.cell.is_closing()
    }
}

impl Closeable for LeakWatchdog {
    fn close(&self) -> ResourceResult<()> {
        self.cell.close_with(|| {
            drop(self.stop.lock().take());
            let handle = self.handle.lock().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::warn!(target: "tether::leak", "leak watchdog thread panicked");
                }
            }
            tracing::debug!(
                target: "tether::leak",
                sweeps = self.sweeps(),
                leaks = self.leaks_found(),
                "leak watchdog stopped"
            );
            Ok(())
        })
    }
}

impl Drop for LeakWatchdog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

crate::impl_close_quietly!(LeakWatchdog);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracingConfig;
    use crate::tracer::TracingReferenceCounted;

    #[test]
    fn test_watchdog_finds_leaks() {
        let registry = Arc::new(LeakRegistry::new(TracingConfig {
            enabled: true,
            ..TracingConfig::default()
        }));
        let leaked = TracingReferenceCounted::in_registry(&registry, || {}, "w-1", "Buffer");
        drop(leaked);

        let watchdog = LeakWatchdog::start(Arc::clone(&registry), Duration::from_millis(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while watchdog.leaks_found() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(watchdog.leaks_found(), 1);
        assert!(registry.is_empty());

        watchdog.close().unwrap();
        assert!(watchdog.is_closed());
        let sweeps = watchdog.sweeps();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(watchdog.sweeps(), sweeps);
    }
}
