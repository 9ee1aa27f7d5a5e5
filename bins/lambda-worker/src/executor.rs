//! Job Executor
//!
//! Takes one claimed queue entry through its whole life:
//! record RUNNING, run the sandbox, record the terminal outcome, publish,
//! then ack.
//!
//! **Failure Split:**
//! - Sandbox failures (throws, timeouts, garbage output) are business outcomes.
//!   They are recorded as FAILED and acked, never retried.
//! - Store failures are infrastructure failures. The entry is nacked and
//!   the queue's backoff and dead-letter policy takes over.

use lambda_common::error::StoreError;
use lambda_common::publisher::UpdatePublisher;
use lambda_common::queue::{JobQueue, NackOutcome};
use lambda_common::store::JobStore;
use lambda_common::types::{Applied, JobStatus, JobTransition, QueueEntry, StatusUpdate};
use lambda_common::Config;
use std::sync::Arc;
use std::time::Duration;

use crate::launcher::Launcher;

/// What happened to a claimed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Ran and recorded a terminal status
    Finished(JobStatus),
    /// Acked without running (record missing or already terminal)
    Skipped,
    Retrying { attempt: u8, delay: Duration },
    DeadLettered { attempts: u8 },
    /// Neither acked nor nacked; the visibility timeout will hand it out again
    Abandoned,
}

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    launcher: Arc<dyn Launcher>,
    publisher: Arc<dyn UpdatePublisher>,
    config: Config,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        launcher: Arc<dyn Launcher>,
        publisher: Arc<dyn UpdatePublisher>,
        config: Config,
    ) -> Self {
        Self {
            store,
            queue,
            launcher,
            publisher,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub async fn process(&self, entry: &QueueEntry) -> Processed {
        match self.run(entry).await {
            Ok(processed) => {
                if let Err(e) = self.queue.ack(entry).await {
                    // Reclaim will find the record terminal and ack then
                    tracing::error!(job_id = %entry.job_id, error = %e, "failed to ack queue entry");
                }
                processed
            }
            Err(e) => self.retry_or_bury(entry, e).await,
        }
    }

    async fn run(&self, entry: &QueueEntry) -> Result<Processed, StoreError> {
        let job_id = entry.job_id;

        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(job_id = %job_id, "queue entry has no job record, dropping");
                return Ok(Processed::Skipped);
            }
            Err(e) => return Err(e),
        };
        if job.status.is_terminal() {
            tracing::info!(job_id = %job_id, status = %job.status, "job already finished, not running again");
            return Ok(Processed::Skipped);
        }

        tracing::info!(
            job_id = %job_id,
            attempt = entry.metadata.attempts + 1,
            timeout_ms = entry.payload.timeout_ms,
            "processing job"
        );

        let (running, applied) = match self.store.update(job_id, &JobTransition::start()).await {
            Ok(updated) => updated,
            Err(StoreError::NotFound(_)) => return Ok(purged(job_id)),
            Err(e) => return Err(e),
        };
        if applied == Applied::Changed {
            self.publisher.publish(StatusUpdate::from(&running));
        } else {
            tracing::info!(job_id = %job_id, "resuming job left RUNNING by an earlier claim");
        }

        let limits = self.config.limits_for(entry.payload.timeout_ms);
        let result = self
            .launcher
            .execute(&entry.payload.code, &entry.payload.args, &limits)
            .await;

        let (finished, applied) = match self.store.update(job_id, &JobTransition::finish(result)).await {
            Ok(updated) => updated,
            Err(StoreError::NotFound(_)) => return Ok(purged(job_id)),
            Err(e) => return Err(e),
        };
        if applied == Applied::Changed {
            self.publisher.publish(StatusUpdate::from(&finished));
        }

        match finished.status {
            JobStatus::Completed => tracing::info!(
                job_id = %job_id,
                execution_time_ms = finished.execution_time_ms,
                "job completed"
            ),
            _ => tracing::info!(
                job_id = %job_id,
                execution_time_ms = finished.execution_time_ms,
                error = finished.error.as_deref().unwrap_or(""),
                "job failed"
            ),
        }

        Ok(Processed::Finished(finished.status))
    }

    async fn retry_or_bury(&self, entry: &QueueEntry, error: StoreError) -> Processed {
        let reason = error.to_string();

        match self.queue.nack(entry, &reason).await {
            Ok(NackOutcome::Retrying { attempt, delay }) => {
                tracing::warn!(
                    job_id = %entry.job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "job hit an infrastructure failure, retrying"
                );
                Processed::Retrying { attempt, delay }
            }
            Ok(NackOutcome::DeadLettered { attempts }) => {
                tracing::error!(
                    job_id = %entry.job_id,
                    attempts,
                    error = %reason,
                    "job exhausted its retries, dead-lettered"
                );
                self.fail_dead_lettered(entry, &reason).await;
                Processed::DeadLettered { attempts }
            }
            Err(e) => {
                tracing::error!(job_id = %entry.job_id, error = %e, "failed to nack queue entry");
                Processed::Abandoned
            }
        }
    }

    /// Best effort: a RUNNING record of a dead-lettered entry is closed as FAILED
    async fn fail_dead_lettered(&self, entry: &QueueEntry, reason: &str) {
        let job = match self.store.get(entry.job_id).await {
            Ok(job) => job,
            Err(_) => return,
        };
        if job.status != JobStatus::Running {
            return;
        }

        let transition = JobTransition::fail(format!("Retries exhausted: {}", reason));
        match self.store.update(entry.job_id, &transition).await {
            Ok((failed, Applied::Changed)) => self.publisher.publish(StatusUpdate::from(&failed)),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id = %entry.job_id, error = %e, "could not mark dead-lettered job FAILED");
            }
        }
    }
}

/// The record vanished mid-run (bulk purge); a nack would resurrect the entry
fn purged(job_id: uuid::Uuid) -> Processed {
    tracing::warn!(job_id = %job_id, "job record deleted while running, dropping");
    Processed::Skipped
}
