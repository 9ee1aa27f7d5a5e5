//! Dispatcher / worker pool.
//!
//! `concurrency` slots each loop claim → rate token → process. A slot is the
//! unit of concurrency: it holds at most one job, so at most `concurrency`
//! sandboxes run at once. Shutdown stops new claims and lets running jobs
//! finish.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use lambda_common::types::JobStatus;
use lambda_common::Config;

use crate::executor::{JobExecutor, Processed};
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl DispatcherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }
}

/// Live counters, shared with the health endpoint
#[derive(Debug, Default)]
pub struct DispatcherStats {
    active: AtomicU64,
    claimed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
    claim_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub active: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub abandoned: u64,
    pub claim_errors: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            claim_errors: self.claim_errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, processed: Processed) {
        let counter = match processed {
            Processed::Finished(JobStatus::Completed) => &self.completed,
            Processed::Finished(_) => &self.failed,
            Processed::Skipped => &self.skipped,
            Processed::Retrying { .. } => &self.retried,
            Processed::DeadLettered { .. } => &self.dead_lettered,
            Processed::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    executor: Arc<JobExecutor>,
    limiter: Arc<RateLimiter>,
    stats: Arc<DispatcherStats>,
    options: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(executor: Arc<JobExecutor>, limiter: Arc<RateLimiter>, options: DispatcherOptions) -> Self {
        Self {
            executor,
            limiter,
            stats: Arc::new(DispatcherStats::default()),
            options,
        }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }

    /// Run every slot until `shutdown` turns true (or its sender is dropped),
    /// then wait for jobs already claimed to finish.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.options.concurrency,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "dispatcher started"
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.options.concurrency {
            slots.spawn(worker_slot(
                slot,
                self.executor.clone(),
                self.limiter.clone(),
                self.stats.clone(),
                self.options.poll_interval,
                shutdown.clone(),
            ));
        }

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker slot ended abnormally");
            }
        }
        tracing::info!("dispatcher stopped");
    }
}

async fn worker_slot(
    slot: usize,
    executor: Arc<JobExecutor>,
    limiter: Arc<RateLimiter>,
    stats: Arc<DispatcherStats>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match executor.queue().claim().await {
            Ok(Some(entry)) => {
                stats.claimed.fetch_add(1, Ordering::Relaxed);
                limiter.acquire().await;

                stats.active.fetch_add(1, Ordering::Relaxed);
                let processed = executor.process(&entry).await;
                stats.active.fetch_sub(1, Ordering::Relaxed);
                stats.record(processed);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                stats.claim_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot, error = %e, "claim failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(slot, "worker slot stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::FakeLauncher;
    use lambda_common::memory::{MemoryJobStore, MemoryQueue};
    use lambda_common::publisher::NoopPublisher;
    use lambda_common::queue::{EnqueueOptions, JobQueue};
    use lambda_common::store::JobStore;
    use lambda_common::types::Job;
    use serde_json::json;

    struct Setup {
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryQueue>,
        launcher: Arc<FakeLauncher>,
        dispatcher: Arc<Dispatcher>,
    }

    fn setup(concurrency: usize, rate: u32, launcher: FakeLauncher) -> Setup {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let launcher = Arc::new(launcher);
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            queue.clone(),
            launcher.clone(),
            Arc::new(NoopPublisher),
            Config::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            executor,
            Arc::new(RateLimiter::per_second(rate)),
            DispatcherOptions {
                concurrency,
                poll_interval: Duration::from_millis(10),
            },
        ));
        Setup {
            store,
            queue,
            launcher,
            dispatcher,
        }
    }

    async fn submit(setup: &Setup, count: usize) {
        for i in 0..count {
            let job = Job::new(format!("function main() {{ return {}; }}", i), vec![json!(i)], 1_000);
            setup.store.create(&job).await.unwrap();
            setup
                .queue
                .enqueue(job.id, job.payload(), EnqueueOptions::default())
                .await
                .unwrap();
        }
    }

    async fn wait_for_completed(store: &MemoryJobStore, count: usize) {
        for _ in 0..500 {
            if store.count_by_status(JobStatus::Completed).await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs did not complete in time");
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_is_respected() {
        let mut launcher = FakeLauncher::sum();
        launcher.delay = Duration::from_millis(200);
        let setup = setup(2, 0, launcher);
        submit(&setup, 5).await;

        let (tx, rx) = watch::channel(false);
        let dispatcher = setup.dispatcher.clone();
        let running = tokio::spawn(async move { dispatcher.run(rx).await });

        wait_for_completed(&setup.store, 5).await;
        tx.send(true).unwrap();
        running.await.unwrap();

        assert_eq!(setup.launcher.calls.load(Ordering::SeqCst), 5);
        assert!(setup.launcher.max_active.load(Ordering::SeqCst) <= 2);

        let stats = setup.dispatcher.stats().snapshot();
        assert_eq!(stats.claimed, 5);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.active, 0);
        assert_eq!(setup.queue.depth().await.unwrap().completed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spaces_job_starts() {
        let setup = setup(5, 2, FakeLauncher::sum());
        submit(&setup, 4).await;

        let started = tokio::time::Instant::now();
        let (tx, rx) = watch::channel(false);
        let dispatcher = setup.dispatcher.clone();
        let running = tokio::spawn(async move { dispatcher.run(rx).await });

        wait_for_completed(&setup.store, 4).await;
        assert!(started.elapsed() >= Duration::from_secs(1));

        tx.send(true).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_with_empty_queue() {
        let setup = setup(3, 0, FakeLauncher::sum());
        let (tx, rx) = watch::channel(false);
        let dispatcher = setup.dispatcher.clone();
        let running = tokio::spawn(async move { dispatcher.run(rx).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(setup.dispatcher.stats().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_options_from_config() {
        let options = DispatcherOptions::from_config(&Config::default());
        assert_eq!(options.concurrency, 5);
        assert_eq!(options.poll_interval, Duration::from_millis(500));
    }
}
