//! Queue worker loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::handler::{TaskHandler, TaskOutcome};
use super::{FailOutcome, TaskQueue};
use crate::types::YieldError;

/// Pulls tasks off the queue and runs them, one at a time.
pub struct Worker {
    id: usize,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<TaskHandler>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<TaskHandler>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            handler,
            poll_interval,
        }
    }

    /// Run until `shutdown` flips to true. A task already in flight is
    /// finished before the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Queue error");
                    false
                }
            };

            // Drain back-to-back while there is work; otherwise wait.
            if worked {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker = self.id, "Worker stopped");
    }

    /// Claim and run one task. Returns false when nothing was due.
    pub async fn run_once(&self) -> Result<bool, YieldError> {
        let Some(envelope) = self.queue.claim().await? else {
            return Ok(false);
        };

        debug!(
            worker = self.id,
            task_id = %envelope.id,
            task = %envelope.task,
            attempt = envelope.attempts,
            "Task claimed"
        );

        match self.handler.handle(&envelope.task).await {
            Ok(outcome) => {
                self.queue.complete(&envelope.id).await?;
                log_outcome(self.id, &envelope.id, &outcome);
            }
            Err(e) => {
                match self.queue.fail(&envelope.id, &e.to_string(), e.is_retryable()).await? {
                    FailOutcome::Retrying { delay } => warn!(
                        worker = self.id,
                        task_id = %envelope.id,
                        task = %envelope.task,
                        attempt = envelope.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Task failed, will retry"
                    ),
                    FailOutcome::Dead => error!(
                        worker = self.id,
                        task_id = %envelope.id,
                        task = %envelope.task,
                        attempt = envelope.attempts,
                        error = %e,
                        "Task failed permanently"
                    ),
                }
            }
        }

        Ok(true)
    }
}

fn log_outcome(worker: usize, task_id: &str, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::ProtocolStored(p) => {
            info!(worker, task_id = %task_id, slug = %p.slug, "pull_protocol done")
        }
        TaskOutcome::ProtocolAlreadyKnown(slug) => {
            debug!(worker, task_id = %task_id, slug = %slug, "pull_protocol no-op")
        }
        TaskOutcome::Ingested(report) => info!(
            worker,
            task_id = %task_id,
            persisted = report.persisted.len(),
            deferred = report.deferred.len(),
            "pull_pools done"
        ),
        TaskOutcome::Recommended(rec) => info!(
            worker,
            task_id = %task_id,
            recommendation_id = rec.id,
            "build_recommendation done"
        ),
    }
}
