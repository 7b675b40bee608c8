//! Adaptive polling loop for both feeds and the purge.
//!
//! Intervals are re-read from the live settings every time a task is
//! dispatched, so an admin change takes effect from the next dispatch on.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{PURGE_INTERVAL, Settings};
use crate::model::Source;
use crate::service::ObservationService;

const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Tasks due in one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Due {
    osmc: bool,
    ndbc: bool,
    purge: bool,
}

/// Next-due instant per task. All tasks start due.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    osmc: Instant,
    ndbc: Instant,
    purge: Instant,
}

impl Schedule {
    fn new(now: Instant) -> Self {
        Self {
            osmc: now,
            ndbc: now,
            purge: now,
        }
    }

    /// Returns the tasks due at `now` and pushes each one's next-due forward.
    fn take_due(&mut self, now: Instant, settings: &Settings) -> Due {
        let mut due = Due::default();
        if now >= self.osmc {
            due.osmc = true;
            self.osmc = now + settings.osmc_interval();
        }
        if now >= self.ndbc {
            due.ndbc = true;
            self.ndbc = now + settings.ndbc_interval();
        }
        if now >= self.purge {
            due.purge = true;
            self.purge = now + PURGE_INTERVAL;
        }
        due
    }

    /// Earliest next-due instant, but never sooner than one second after `now`.
    fn next_wake(&self, now: Instant) -> Instant {
        self.osmc.min(self.ndbc).min(self.purge).max(now + MIN_SLEEP)
    }
}

pub struct Scheduler {
    service: Arc<ObservationService>,
}

impl Scheduler {
    pub fn new(service: Arc<ObservationService>) -> Self {
        Self { service }
    }

    async fn fetch_if(&self, due: bool, source: Source) {
        if due {
            // Failures are logged and recorded by the service.
            let _ = self.service.run_fetch(source).await;
        }
    }

    /// Runs until `ctx` is cancelled. In-flight fetches are dropped on cancellation.
    pub async fn run(&self, ctx: CancellationToken) {
        info!("Scheduler started");
        let mut schedule = Schedule::new(Instant::now());

        loop {
            let now = Instant::now();
            let due = schedule.take_due(now, &self.service.settings().get());
            debug!(?due, "Scheduler tick");

            if due.purge {
                self.service.purge();
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = async {
                    tokio::join!(
                        self.fetch_if(due.osmc, Source::Osmc),
                        self.fetch_if(due.ndbc, Source::Ndbc),
                    )
                } => {}
            }

            let wake = schedule.next_wake(Instant::now());
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
        info!("Scheduler stopped");
    }
}
