//! In-process queue and store backends.
//!
//! Same contracts as the Redis backends, held behind a single async mutex.
//! Used by tests and by single-process development setups.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{QueueResult, StoreError, StoreResult};
use crate::queue::{
    new_entry, register_failure, EnqueueOptions, JobQueue, NackOutcome, QueueDepth, QueueOptions,
    Retention,
};
use crate::store::{page_count, JobStore};
use crate::types::{Applied, Job, JobPage, JobStatus, JobTransition, QueueEntry, QueuePayload};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    delayed: Vec<(Instant, Uuid)>,
    in_flight: HashMap<Uuid, Instant>,
    completed: VecDeque<(Instant, Uuid)>,
    dead: VecDeque<(Instant, Uuid)>,
    entries: HashMap<Uuid, QueueEntry>,
}

impl QueueState {
    /// Move due retries to the tail and expired claims to the head
    fn promote(&mut self, now: Instant) {
        self.delayed.sort_by_key(|(ready, _)| *ready);
        let due = self.delayed.partition_point(|(ready, _)| *ready <= now);
        for (_, id) in self.delayed.drain(..due) {
            self.pending.push_back(id);
        }

        let mut expired: Vec<(Instant, Uuid)> = self
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        expired.sort();
        for (_, id) in expired.into_iter().rev() {
            self.in_flight.remove(&id);
            self.pending.push_front(id);
        }
    }

    fn prune(
        finished: &mut VecDeque<(Instant, Uuid)>,
        entries: &mut HashMap<Uuid, QueueEntry>,
        retention: Retention,
        now: Instant,
    ) {
        while let Some((at, id)) = finished.front().copied() {
            let too_old = now.saturating_duration_since(at) > retention.age;
            let too_many = finished.len() as u64 > retention.count;
            if !too_old && !too_many {
                break;
            }
            finished.pop_front();
            entries.remove(&id);
        }
    }
}

pub struct MemoryQueue {
    state: Mutex<QueueState>,
    options: QueueOptions,
}

impl MemoryQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            options,
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        job_id: Uuid,
        payload: QueuePayload,
        options: EnqueueOptions,
    ) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&job_id) {
            return Ok(false);
        }
        state
            .entries
            .insert(job_id, new_entry(job_id, payload, options, &self.options));
        state.pending.push_back(job_id);
        Ok(true)
    }

    async fn claim(&self) -> QueueResult<Option<QueueEntry>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.promote(now);

        while let Some(id) = state.pending.pop_front() {
            if let Some(entry) = state.entries.get(&id).cloned() {
                state
                    .in_flight
                    .insert(id, now + self.options.visibility_timeout);
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn ack(&self, entry: &QueueEntry) -> QueueResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let state = &mut *state;

        state.in_flight.remove(&entry.job_id);
        state.completed.push_back((now, entry.job_id));
        QueueState::prune(
            &mut state.completed,
            &mut state.entries,
            self.options.keep_completed,
            now,
        );
        Ok(())
    }

    async fn nack(&self, entry: &QueueEntry, error: &str) -> QueueResult<NackOutcome> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let current = state
            .entries
            .get(&entry.job_id)
            .cloned()
            .unwrap_or_else(|| entry.clone());
        let (updated, outcome) = register_failure(current, error, &self.options);

        state.in_flight.remove(&entry.job_id);
        state.entries.insert(entry.job_id, updated);
        match outcome {
            NackOutcome::Retrying { delay, .. } => {
                state.delayed.push((now + delay, entry.job_id));
            }
            NackOutcome::DeadLettered { .. } => {
                state.dead.push_back((now, entry.job_id));
                QueueState::prune(
                    &mut state.dead,
                    &mut state.entries,
                    self.options.keep_failed,
                    now,
                );
            }
        }
        Ok(outcome)
    }

    async fn drain(&self) -> QueueResult<()> {
        *self.state.lock().await = QueueState::default();
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let state = self.state.lock().await;
        Ok(QueueDepth {
            pending: state.pending.len() as u64,
            delayed: state.delayed.len() as u64,
            in_flight: state.in_flight.len() as u64,
            completed: state.completed.len() as u64,
            dead: state.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<QueueEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .dead
            .iter()
            .rev()
            .filter_map(|(_, id)| state.entries.get(id).cloned())
            .take(limit)
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|job| job.status == status)
            .count()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> StoreResult<Uuid> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Job> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: Uuid, transition: &JobTransition) -> StoreResult<(Job, Applied)> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Apply to a copy so a rejected transition leaves the record untouched
        let mut next = job.clone();
        let applied = next
            .apply(transition)
            .map_err(|source| StoreError::Transition { id, source })?;
        *job = next.clone();
        Ok((next, applied))
    }

    async fn list(&self, page: u32, limit: u32) -> StoreResult<JobPage> {
        let page = page.max(1);
        let jobs = self.jobs.lock().await;
        let total = jobs.len() as u64;

        let mut all: Vec<&Job> = jobs.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let skip = (page as usize - 1).saturating_mul(limit as usize);
        let page_jobs = all
            .into_iter()
            .skip(skip)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(JobPage {
            jobs: page_jobs,
            total,
            page,
            pages: page_count(total, limit),
        })
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.len() as u64;
        jobs.clear();
        Ok(removed)
    }
}
