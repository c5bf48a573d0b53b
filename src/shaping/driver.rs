//! Reconciliation Driver
//!
//! Periodically decays the sketch and sweeps the flow table of a handle.
//! Sweeps of one engine never overlap; a tick that finds a sweep in progress
//! is skipped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::clock::Timestamp;
use super::engine::SweepReport;
use super::handle::CoreHandle;

/// Shortest tick the driver will run with
const MIN_TICK: Duration = Duration::from_millis(1);

/// Periodic reconciliation for one handle
#[derive(Debug, Clone)]
pub struct ReconciliationDriver {
    handle: CoreHandle,
    tick: Duration,
    clock: fn() -> Timestamp,
}

impl ReconciliationDriver {
    /// Driver ticking at the handle's configured sweep interval
    pub fn new(handle: CoreHandle) -> Self {
        let tick = handle
            .engine()
            .map(|engine| engine.settings().sweep_interval())
            .unwrap_or(MIN_TICK);
        Self::with_tick(handle, tick)
    }

    /// Driver ticking every `tick`
    pub fn with_tick(handle: CoreHandle, tick: Duration) -> Self {
        Self {
            handle,
            tick: tick.max(MIN_TICK),
            clock: Timestamp::now,
        }
    }

    /// Use a different time source; it must match the one stamping events
    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    /// Tick period
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Run one reconciliation pass at `now`
    ///
    /// Returns `None` if the handle was torn down or a pass is already running.
    pub fn run_once(&self, now: Timestamp) -> Option<SweepReport> {
        let engine = self.handle.engine()?;
        let report = engine.reconcile(now)?;
        if report.evicted > 0 || report.demoted > 0 {
            debug!(
                evicted = report.evicted,
                demoted = report.demoted,
                tracked = report.tracked,
                "flow table reconciled"
            );
        }
        Some(report)
    }

    /// Run on the tokio runtime until shut down or the handle is torn down
    pub fn spawn(self) -> DriverTask {
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);

        let join = tokio::spawn(async move {
            let mut ticker = time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_ms = self.tick.as_millis() as u64, "reconciliation driver started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = signal.notified() => {
                        info!("reconciliation driver stopping");
                        break;
                    }
                }

                if !self.handle.is_active() {
                    info!("handle torn down, reconciliation driver exiting");
                    break;
                }
                if self.run_once((self.clock)()).is_none() {
                    debug!("reconciliation tick skipped");
                }
            }
        });

        DriverTask { shutdown, join }
    }
}

/// Running driver
#[derive(Debug)]
pub struct DriverTask {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl DriverTask {
    /// Stop the driver and wait for it to exit
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            warn!(error = %e, "reconciliation driver ended abnormally");
        }
    }

    /// Whether the driver task has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
