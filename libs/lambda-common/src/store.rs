//! Job record store: CRUD over job records with atomic typed transitions.

use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::redis::{job_key, JOB_INDEX, JOB_PREFIX};
use crate::types::{Applied, Job, JobLogs, JobPage, JobTransition};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> StoreResult<Uuid>;

    async fn get(&self, id: Uuid) -> StoreResult<Job>;

    async fn logs(&self, id: Uuid) -> StoreResult<JobLogs> {
        let job = self.get(id).await?;
        Ok(JobLogs {
            logs: job.logs,
            error: job.error,
        })
    }

    /// Apply a transition atomically and return the record as stored after it.
    /// A repeated transition reports `Applied::Unchanged` and leaves the record as is.
    async fn update(&self, id: Uuid, transition: &JobTransition) -> StoreResult<(Job, Applied)>;

    /// Newest first; `page` starts at 1
    async fn list(&self, page: u32, limit: u32) -> StoreResult<JobPage>;

    /// Returns the number of records removed
    async fn delete_all(&self) -> StoreResult<u64>;
}

/// Number of pages needed for `total` records
pub fn page_count(total: u64, limit: u32) -> u32 {
    if limit == 0 {
        return 0;
    }
    u32::try_from(total.div_ceil(u64::from(limit))).unwrap_or(u32::MAX)
}

const UPDATE_RETRIES: usize = 3;

lazy_static! {
    // KEYS: job key | ARGV: expected status, new status, new doc
    static ref COMPARE_AND_SET: redis::Script = redis::Script::new(
        r#"
        if redis.call('HGET', KEYS[1], 'status') == ARGV[1] then
            redis.call('HSET', KEYS[1], 'status', ARGV[2], 'doc', ARGV[3])
            return 1
        end
        return 0
        "#
    );
}

/// Redis-backed store.
/// Each job is a hash `{status, doc}` so transitions can compare-and-set on status;
/// a sorted set indexes ids by creation time.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn decode(id: Uuid, json: &str) -> StoreResult<Job> {
        serde_json::from_str(json).map_err(|source| StoreError::Corrupt { id, source })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: &Job) -> StoreResult<Uuid> {
        let doc = serde_json::to_string(job)?;
        let key = job_key(&job.id);
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .hset_multiple(&key, &[("status", job.status.as_str()), ("doc", doc.as_str())])
            .ignore()
            .zadd(JOB_INDEX, job.id.to_string(), job.created_at.timestamp_millis())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(job.id)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Job> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = conn.hget(job_key(&id), "doc").await?;
        match doc {
            Some(json) => Self::decode(id, &json),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn update(&self, id: Uuid, transition: &JobTransition) -> StoreResult<(Job, Applied)> {
        let key = job_key(&id);
        let mut conn = self.conn.clone();

        for _ in 0..UPDATE_RETRIES {
            let mut job = self.get(id).await?;
            let expected = job.status;

            let applied = job
                .apply(transition)
                .map_err(|source| StoreError::Transition { id, source })?;
            if applied == Applied::Unchanged {
                return Ok((job, applied));
            }

            let doc = serde_json::to_string(&job)?;
            let swapped: i64 = COMPARE_AND_SET
                .key(&key)
                .arg(expected.as_str())
                .arg(job.status.as_str())
                .arg(doc)
                .invoke_async(&mut conn)
                .await?;

            if swapped == 1 {
                return Ok((job, applied));
            }
            tracing::debug!(job_id = %id, "job record changed underneath update, retrying");
        }

        Err(StoreError::Conflict(id))
    }

    async fn list(&self, page: u32, limit: u32) -> StoreResult<JobPage> {
        let page = page.max(1);
        let mut conn = self.conn.clone();

        let total: u64 = conn.zcard(JOB_INDEX).await?;
        if limit == 0 {
            return Ok(JobPage {
                jobs: Vec::new(),
                total,
                page,
                pages: 0,
            });
        }

        let start = isize::try_from(u64::from(page - 1) * u64::from(limit)).unwrap_or(isize::MAX);
        let stop = start.saturating_add(limit as isize - 1);
        let ids: Vec<String> = conn.zrevrange(JOB_INDEX, start, stop).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        if !ids.is_empty() {
            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.hget(format!("{}:{}", JOB_PREFIX, id), "doc");
            }
            let docs: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

            for (raw_id, doc) in ids.iter().zip(docs) {
                let Ok(id) = Uuid::parse_str(raw_id) else {
                    tracing::warn!(id = %raw_id, "skipping malformed id in job index");
                    continue;
                };
                if let Some(json) = doc {
                    jobs.push(Self::decode(id, &json)?);
                }
            }
        }

        Ok(JobPage {
            jobs,
            total,
            page,
            pages: page_count(total, limit),
        })
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(JOB_INDEX, 0, -1).await?;

        let mut keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:{}", JOB_PREFIX, id))
            .collect();
        keys.push(JOB_INDEX.to_string());

        for chunk in keys.chunks(500) {
            conn.del::<_, ()>(chunk).await?;
        }

        Ok(ids.len() as u64)
    }
}
