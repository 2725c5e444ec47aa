use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::failure::{DiskOperation, FailureReporter};
use super::worker::DiskWorker;
use crate::core::{CacheCounters, CleanupConfig, Result};
use crate::disk::SweepReport;

/// Add a finished sweep to the counters
pub(crate) fn count_sweep(report: &SweepReport, counters: &CacheCounters) {
    CacheCounters::incr(&counters.sweeps);
    counters
        .evicted_entries
        .fetch_add(report.removed as u64, Ordering::Relaxed);
    counters
        .evicted_bytes
        .fetch_add(report.freed_bytes, Ordering::Relaxed);
}

/// Record the outcome of a sweep in counters and the failure channel
pub(crate) fn record_sweep(
    result: Result<SweepReport>,
    reporter: &FailureReporter,
    counters: &CacheCounters,
) -> Option<SweepReport> {
    match result {
        Ok(report) => {
            count_sweep(&report, counters);
            Some(report)
        }
        Err(e) => {
            reporter.report(DiskOperation::Sweep, None, e);
            None
        }
    }
}

/// Queue a sweep with the engine's configured limits
pub(crate) fn enqueue_sweep(
    disk: &DiskWorker,
    reporter: &FailureReporter,
    counters: &Arc<CacheCounters>,
) -> Result<()> {
    let reporter = reporter.clone();
    let counters = Arc::clone(counters);
    disk.execute(move |storage| {
        record_sweep(storage.cleanup(), &reporter, &counters);
    })
}

struct SchedulerState {
    /// Guards the check-then-enqueue step against concurrent disabling
    enabled: Mutex<bool>,
    interval_ms: AtomicU64,
}

impl SchedulerState {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }
}

/// Recurring timer that queues disk sweeps on the disk worker.
///
/// Owned by one cache instance; dropping it stops the timer.
pub struct CleanupScheduler {
    state: Arc<SchedulerState>,
    disk: DiskWorker,
    runtime: Handle,
    reporter: FailureReporter,
    counters: Arc<CacheCounters>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupScheduler {
    /// Create a scheduler; it starts immediately when `config.enabled`
    pub fn new(
        config: &CleanupConfig,
        disk: DiskWorker,
        runtime: Handle,
        reporter: FailureReporter,
        counters: Arc<CacheCounters>,
    ) -> Self {
        let scheduler = Self {
            state: Arc::new(SchedulerState {
                enabled: Mutex::new(false),
                interval_ms: AtomicU64::new(Self::to_millis(config.interval())),
            }),
            disk,
            runtime,
            reporter,
            counters,
            task: Mutex::new(None),
        };
        if config.enabled {
            scheduler.set_enabled(true);
        }
        scheduler
    }

    fn to_millis(interval: Duration) -> u64 {
        (interval.as_millis() as u64).max(1)
    }

    pub fn is_enabled(&self) -> bool {
        *self.state.enabled.lock()
    }

    pub fn interval(&self) -> Duration {
        self.state.interval()
    }

    /// Change the period; applies from the next scheduled firing
    pub fn set_interval(&self, interval: Duration) {
        let millis = Self::to_millis(interval);
        self.state.interval_ms.store(millis, Ordering::SeqCst);
        debug!(interval_ms = millis, "Cleanup interval updated");
    }

    /// Start or stop the timer.
    ///
    /// Once disabling returns no further sweep is queued by this scheduler;
    /// a sweep already queued still runs.
    pub fn set_enabled(&self, enabled: bool) {
        let mut task = self.task.lock();
        {
            let mut flag = self.state.enabled.lock();
            if *flag == enabled {
                return;
            }
            *flag = enabled;
        }

        if enabled {
            info!(
                interval_ms = self.state.interval().as_millis() as u64,
                "Starting disk cleanup timer"
            );
            *task = Some(self.runtime.spawn(Self::run(
                Arc::clone(&self.state),
                self.disk.clone(),
                self.reporter.clone(),
                Arc::clone(&self.counters),
            )));
        } else {
            info!("Stopping disk cleanup timer");
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    async fn run(
        state: Arc<SchedulerState>,
        disk: DiskWorker,
        reporter: FailureReporter,
        counters: Arc<CacheCounters>,
    ) {
        loop {
            tokio::time::sleep(state.interval()).await;

            let stop = {
                let enabled = state.enabled.lock();
                if !*enabled {
                    true
                } else if let Err(e) = enqueue_sweep(&disk, &reporter, &counters) {
                    reporter.report(DiskOperation::Sweep, None, e);
                    true
                } else {
                    false
                }
            };
            if stop {
                break;
            }
        }
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
