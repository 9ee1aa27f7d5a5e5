use crate::config::Config;
use crate::error::SubmitError;
use crate::queue::{EnqueueOptions, JobQueue};
use crate::store::JobStore;
use crate::types::{Job, Submission};
use crate::validation::validate_code;

/// Validate a submission, persist it as PENDING and hand it to the queue.
///
/// The record is created before the entry is enqueued, so a worker never
/// claims an entry whose record does not exist yet.
pub async fn submit(
    store: &dyn JobStore,
    queue: &dyn JobQueue,
    submission: Submission,
    config: &Config,
) -> Result<Job, SubmitError> {
    validate_code(&submission.code, config.max_code_chars)?;

    let timeout_ms = config.clamp_timeout(submission.timeout);
    let job = Job::new(submission.code, submission.args, timeout_ms);
    store.create(&job).await?;

    let options = EnqueueOptions {
        max_attempts: Some(config.max_attempts),
    };
    queue
        .enqueue(job.id, job.payload(), options)
        .await
        .map_err(|source| SubmitError::Queue {
            job_id: job.id,
            source,
        })?;

    tracing::info!(job_id = %job.id, timeout_ms, "job submitted");
    Ok(job)
}
