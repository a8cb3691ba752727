//! Periodic ingestion trigger and stale-task sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::{Task, TaskQueue};

/// Floor for the stale sweep period.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// Submits `pull_pools` immediately and then once per interval.
///
/// Also sweeps tasks left `running` for longer than `stale_after` back to
/// pending, so work abandoned by a dead worker is redelivered without
/// waiting for a restart.
pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    interval: Duration,
    limit: usize,
    stale_after: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        interval: Duration,
        limit: usize,
        stale_after: Duration,
    ) -> Self {
        Self {
            queue,
            interval,
            limit,
            stale_after,
        }
    }

    /// Sweep twice per staleness window so an abandoned task waits at most
    /// 1.5 × `stale_after` before it is redelivered.
    fn sweep_period(&self) -> Duration {
        (self.stale_after / 2).max(MIN_SWEEP_PERIOD)
    }

    async fn sweep(&self) {
        match self.queue.requeue_stale(self.stale_after).await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "Re-queued abandoned running tasks"),
            Err(e) => error!(error = %e, "Stale task sweep failed"),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let period = self.sweep_period();
        let mut sweeper = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            limit = self.limit,
            stale_after_secs = self.stale_after.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let task = Task::PullPools { limit: self.limit };
                    match self.queue.submit(&task).await {
                        Ok(id) => info!(task_id = %id, limit = self.limit, "pull_pools scheduled"),
                        Err(e) => error!(error = %e, "Failed to schedule pull_pools"),
                    }
                }
                _ = sweeper.tick() => self.sweep().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}
