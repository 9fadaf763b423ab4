//! Durable expiry scheduling.
//!
//! A granted lease with a period gets one [`ReclaimJob`] in the store's
//! [`ReclaimQueue`]. A sweep ([`ExpiryScheduler::run_due`]) hands due jobs to
//! a reclaim callback that re-validates the row before clearing it; failed
//! reclaims are retried with exponential backoff and eventually buried.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::infrastructure::ReclaimQueue;
use crate::types::{Acquisition, ReclaimJob, ReclaimOutcome};

/// Retry policy for reclaims that fail on a store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimBackoff {
    pub base: Duration,
    pub max: Duration,
    /// Failed attempts after which a job is buried
    pub max_attempts: u32,
}

impl Default for ReclaimBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReclaimBackoff {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based): `base * 2^(attempt - 1)`, capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed: usize,
    pub stale: usize,
    pub retried: usize,
    pub buried: usize,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        *self == ReclaimReport::default()
    }
}

pub struct ExpiryScheduler {
    queue: Arc<dyn ReclaimQueue>,
    backoff: ReclaimBackoff,
    batch: usize,
}

impl ExpiryScheduler {
    pub fn new(queue: Arc<dyn ReclaimQueue>, backoff: ReclaimBackoff, batch: usize) -> Self {
        Self {
            queue,
            backoff,
            batch: batch.max(1),
        }
    }

    /// Persist a reclaim due `delay_ms` after the acquisition instant.
    /// Returns as soon as the job is stored.
    pub fn schedule(&self, acquisition: &Acquisition, delay_ms: u64) -> Result<(), StoreError> {
        let due_at = acquisition.acquired_at.saturating_add(delay_ms);
        if !self.queue.enqueue(acquisition, due_at)? {
            tracing::debug!(
                resource = %acquisition.resource,
                due_at,
                "Reclaim already scheduled"
            );
        }
        Ok(())
    }

    /// Run every job due at `now` through `reclaim`.
    ///
    /// Successful and stale reclaims complete the job. A store error schedules
    /// a retry, or buries the job once `max_attempts` is reached.
    pub fn run_due<F>(&self, now: u64, mut reclaim: F) -> Result<ReclaimReport, StoreError>
    where
        F: FnMut(&Acquisition) -> Result<ReclaimOutcome, StoreError>,
    {
        let mut report = ReclaimReport::default();

        for job in self.queue.due(now, self.batch)? {
            match reclaim(&job.acquisition) {
                Ok(outcome) => {
                    self.queue.complete(job.id)?;
                    match outcome {
                        ReclaimOutcome::Reclaimed => report.reclaimed += 1,
                        ReclaimOutcome::Stale => report.stale += 1,
                    }
                }
                Err(err) => {
                    let attempts = job.attempts + 1;
                    let message = err.to_string();
                    if attempts >= self.backoff.max_attempts {
                        self.queue.bury(job.id, &message)?;
                        report.buried += 1;
                        tracing::error!(
                            job_id = job.id,
                            resource = %job.acquisition.resource,
                            attempts,
                            error = %message,
                            "Reclaim retries exhausted, job buried"
                        );
                    } else {
                        let delay = self.backoff.delay_for(attempts);
                        let next_due = now.saturating_add(delay.as_millis() as u64);
                        self.queue.retry(job.id, next_due, &message)?;
                        report.retried += 1;
                        tracing::warn!(
                            job_id = job.id,
                            resource = %job.acquisition.resource,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "Reclaim failed, will retry"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    /// Jobs that exhausted their retries
    pub fn dead(&self) -> Result<Vec<ReclaimJob>, StoreError> {
        self.queue.dead()
    }

    pub fn pending_count(&self) -> Result<usize, StoreError> {
        self.queue.pending_count()
    }
}
