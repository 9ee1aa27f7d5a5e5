//! Job queue: durable FIFO work list with atomic claim, visibility timeout,
//! exponential retry backoff and dead-lettering.

use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{QueueError, QueueResult};
use crate::redis::{queue_key, QueuePart};
use crate::types::{QueueEntry, QueuePayload};

/// How long and how many finished entries are kept around
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub count: u64,
    pub age: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub max_attempts: u8,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub visibility_timeout: Duration,
    pub keep_completed: Retention,
    pub keep_failed: Retention,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "jobs".to_string(),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            visibility_timeout: Duration::from_secs(330),
            keep_completed: Retention {
                count: 100,
                age: Duration::from_secs(24 * 3600),
            },
            keep_failed: Retention {
                count: 1000,
                age: Duration::from_secs(7 * 24 * 3600),
            },
        }
    }
}

impl QueueOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            visibility_timeout: config.visibility_timeout(),
            ..Self::default()
        }
    }
}

/// Per-entry overrides at enqueue time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u8>,
}

/// What `nack` did with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Retrying { attempt: u8, delay: Duration },
    DeadLettered { attempts: u8 },
}

/// Entry counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub delayed: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub dead: u64,
}

/// Queue contract shared by the Redis and in-memory backends.
///
/// `claim` is the only operation workers race on; implementations must make
/// it atomic so no entry is handed to two workers while it is in flight.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append an entry. Returns `false` if the id was already known.
    async fn enqueue(
        &self,
        job_id: Uuid,
        payload: QueuePayload,
        options: EnqueueOptions,
    ) -> QueueResult<bool>;

    /// Take the oldest claimable entry, if any
    async fn claim(&self) -> QueueResult<Option<QueueEntry>>;

    async fn ack(&self, entry: &QueueEntry) -> QueueResult<()>;

    /// Record an infrastructure failure: retry after backoff or dead-letter
    async fn nack(&self, entry: &QueueEntry, error: &str) -> QueueResult<NackOutcome>;

    /// Remove every entry in every state
    async fn drain(&self) -> QueueResult<()>;

    async fn depth(&self) -> QueueResult<QueueDepth>;

    /// Most recently dead-lettered entries first
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<QueueEntry>>;
}

/// Delay before retry number `attempts_made`: base × 2^(attempts_made - 1), capped
pub fn backoff_delay(attempts_made: u8, base: Duration, max: Duration) -> Duration {
    let exponent = u32::from(attempts_made.saturating_sub(1)).min(31);
    base.checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max)
}

/// Bump the attempt counter and decide between retry and dead-letter
pub(crate) fn register_failure(
    mut entry: QueueEntry,
    error: &str,
    options: &QueueOptions,
) -> (QueueEntry, NackOutcome) {
    entry.metadata.attempts = entry.metadata.attempts.saturating_add(1);
    entry.metadata.last_failure_reason = Some(error.to_string());

    let attempts = entry.metadata.attempts;
    let outcome = if attempts >= entry.metadata.max_attempts {
        NackOutcome::DeadLettered { attempts }
    } else {
        NackOutcome::Retrying {
            attempt: attempts,
            delay: backoff_delay(attempts, options.backoff_base, options.backoff_max),
        }
    };

    (entry, outcome)
}

pub(crate) fn new_entry(job_id: Uuid, payload: QueuePayload, options: EnqueueOptions, defaults: &QueueOptions) -> QueueEntry {
    QueueEntry::new(
        job_id,
        payload,
        options.max_attempts.unwrap_or(defaults.max_attempts).max(1),
    )
}

lazy_static! {
    // KEYS: pending, entries | ARGV: id, entry
    static ref ENQUEUE_SCRIPT: redis::Script = redis::Script::new(
        r#"
        if redis.call('HSETNX', KEYS[2], ARGV[1], ARGV[2]) == 1 then
            redis.call('RPUSH', KEYS[1], ARGV[1])
            return 1
        end
        return 0
        "#
    );

    // KEYS: pending, delayed, inflight, entries | ARGV: now_ms, visibility_ms
    static ref CLAIM_SCRIPT: redis::Script = redis::Script::new(
        r#"
        local now = tonumber(ARGV[1])
        local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
        for _, id in ipairs(due) do
            redis.call('ZREM', KEYS[2], id)
            redis.call('RPUSH', KEYS[1], id)
        end
        local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
        for i = #expired, 1, -1 do
            redis.call('ZREM', KEYS[3], expired[i])
            redis.call('LPUSH', KEYS[1], expired[i])
        end
        while true do
            local id = redis.call('LPOP', KEYS[1])
            if not id then
                return false
            end
            local entry = redis.call('HGET', KEYS[4], id)
            if entry then
                redis.call('ZADD', KEYS[3], now + tonumber(ARGV[2]), id)
                return {id, entry}
            end
        end
        "#
    );

    // KEYS: finished zset, entries | ARGV: cutoff_ms, keep_count
    static ref PRUNE_SCRIPT: redis::Script = redis::Script::new(
        r#"
        local removed = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        local excess = redis.call('ZCARD', KEYS[1]) - #removed - tonumber(ARGV[2])
        if excess > 0 then
            local extra = redis.call('ZRANGE', KEYS[1], #removed, #removed + excess - 1)
            for _, id in ipairs(extra) do
                table.insert(removed, id)
            end
        end
        for _, id in ipairs(removed) do
            redis.call('ZREM', KEYS[1], id)
            redis.call('HDEL', KEYS[2], id)
        end
        return #removed
        "#
    );
}

/// Redis-backed queue.
/// Cheap to clone; every clone shares the same managed connection.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    options: QueueOptions,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, options: QueueOptions) -> Self {
        Self { conn, options }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn key(&self, part: QueuePart) -> String {
        queue_key(&self.options.name, part)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn millis(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }

    async fn prune(&self, part: QueuePart, retention: Retention) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let cutoff = Self::now_ms() - Self::millis(retention.age);
        let removed: u64 = PRUNE_SCRIPT
            .key(self.key(part))
            .key(self.key(QueuePart::Entries))
            .arg(cutoff)
            .arg(retention.count)
            .invoke_async(&mut conn)
            .await?;

        if removed > 0 {
            tracing::debug!(removed, part = ?part, "pruned finished queue entries");
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(
        &self,
        job_id: Uuid,
        payload: QueuePayload,
        options: EnqueueOptions,
    ) -> QueueResult<bool> {
        let entry = new_entry(job_id, payload, options, &self.options);
        let json = serde_json::to_string(&entry)?;

        let mut conn = self.conn.clone();
        let added: i64 = ENQUEUE_SCRIPT
            .key(self.key(QueuePart::Pending))
            .key(self.key(QueuePart::Entries))
            .arg(job_id.to_string())
            .arg(json)
            .invoke_async(&mut conn)
            .await?;

        Ok(added == 1)
    }

    async fn claim(&self) -> QueueResult<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let claimed: Option<(String, String)> = CLAIM_SCRIPT
            .key(self.key(QueuePart::Pending))
            .key(self.key(QueuePart::Delayed))
            .key(self.key(QueuePart::InFlight))
            .key(self.key(QueuePart::Entries))
            .arg(Self::now_ms())
            .arg(Self::millis(self.options.visibility_timeout))
            .invoke_async(&mut conn)
            .await?;

        let Some((id, json)) = claimed else {
            return Ok(None);
        };

        match serde_json::from_str::<QueueEntry>(&json) {
            Ok(entry) => Ok(Some(entry)),
            Err(source) => {
                // Park it with the dead letters so it is not reclaimed forever
                redis::pipe()
                    .atomic()
                    .zrem(self.key(QueuePart::InFlight), &id)
                    .ignore()
                    .zadd(self.key(QueuePart::Dead), &id, Self::now_ms())
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Err(QueueError::Corrupt { id, source })
            }
        }
    }

    async fn ack(&self, entry: &QueueEntry) -> QueueResult<()> {
        let id = entry.job_id.to_string();
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .zrem(self.key(QueuePart::InFlight), &id)
            .ignore()
            .zadd(self.key(QueuePart::Completed), &id, Self::now_ms())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.prune(QueuePart::Completed, self.options.keep_completed)
            .await
    }

    async fn nack(&self, entry: &QueueEntry, error: &str) -> QueueResult<NackOutcome> {
        let id = entry.job_id.to_string();
        let mut conn = self.conn.clone();

        let stored: Option<String> = conn.hget(self.key(QueuePart::Entries), &id).await?;
        let current = match stored {
            Some(json) => serde_json::from_str(&json).map_err(|source| QueueError::Corrupt {
                id: id.clone(),
                source,
            })?,
            None => entry.clone(),
        };

        let (updated, outcome) = register_failure(current, error, &self.options);
        let json = serde_json::to_string(&updated)?;
        let now = Self::now_ms();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(self.key(QueuePart::InFlight), &id)
            .ignore()
            .hset(self.key(QueuePart::Entries), &id, json)
            .ignore();
        match outcome {
            NackOutcome::Retrying { delay, .. } => {
                pipe.zadd(self.key(QueuePart::Delayed), &id, now + Self::millis(delay))
                    .ignore();
            }
            NackOutcome::DeadLettered { .. } => {
                pipe.zadd(self.key(QueuePart::Dead), &id, now).ignore();
            }
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        if matches!(outcome, NackOutcome::DeadLettered { .. }) {
            self.prune(QueuePart::Dead, self.options.keep_failed).await?;
        }
        Ok(outcome)
    }

    async fn drain(&self) -> QueueResult<()> {
        let keys: Vec<String> = QueuePart::all().iter().map(|part| self.key(*part)).collect();
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .del(keys)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.conn.clone();
        let (pending, delayed, in_flight, completed, dead): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(self.key(QueuePart::Pending))
                .zcard(self.key(QueuePart::Delayed))
                .zcard(self.key(QueuePart::InFlight))
                .zcard(self.key(QueuePart::Completed))
                .zcard(self.key(QueuePart::Dead))
                .query_async(&mut conn)
                .await?;

        Ok(QueueDepth {
            pending,
            delayed,
            in_flight,
            completed,
            dead,
        })
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn.zrevrange(self.key(QueuePart::Dead), 0, stop).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key(QueuePart::Entries))
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        ids.into_iter()
            .zip(raw)
            .filter_map(|(id, json)| json.map(|json| (id, json)))
            .map(|(id, json)| {
                serde_json::from_str(&json).map_err(|source| QueueError::Corrupt { id, source })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueuePayload;

    fn entry(max_attempts: u8) -> QueueEntry {
        QueueEntry::new(
            Uuid::new_v4(),
            QueuePayload {
                code: "x".to_string(),
                args: vec![],
                timeout_ms: 1000,
            },
            max_attempts,
        )
    }

    #[test]
    fn test_backoff_is_exponential() {
        let base = Duration::from_millis(2000);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_millis(2000);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(10, base, max), max);
        assert_eq!(backoff_delay(255, base, max), max);
    }

    #[test]
    fn test_register_failure_retries_then_dead_letters() {
        let options = QueueOptions::default();

        let (first, outcome) = register_failure(entry(3), "store down", &options);
        assert_eq!(
            outcome,
            NackOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(first.metadata.last_failure_reason.as_deref(), Some("store down"));

        let (second, outcome) = register_failure(first, "store down", &options);
        assert_eq!(
            outcome,
            NackOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_secs(4)
            }
        );

        let (third, outcome) = register_failure(second, "still down", &options);
        assert_eq!(outcome, NackOutcome::DeadLettered { attempts: 3 });
        assert_eq!(third.metadata.last_failure_reason.as_deref(), Some("still down"));
    }

    #[test]
    fn test_options_from_config() {
        let config = Config::default();
        let options = QueueOptions::from_config(&config);
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.backoff_base, Duration::from_secs(2));
        assert_eq!(options.visibility_timeout, config.visibility_timeout());
    }

    async fn redis_queue(options: QueueOptions) -> RedisQueue {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let conn = crate::redis::connect(&url).await.unwrap();
        RedisQueue::new(
            conn,
            QueueOptions {
                name: format!("test-{}", Uuid::new_v4()),
                ..options
            },
        )
    }

    async fn push(queue: &RedisQueue, max_attempts: Option<u8>) -> Uuid {
        let id = Uuid::new_v4();
        let added = queue
            .enqueue(id, entry(3).payload, EnqueueOptions { max_attempts })
            .await
            .unwrap();
        assert!(added);
        id
    }

    #[tokio::test]
    #[ignore = "needs a Redis server"]
    async fn test_redis_claims_in_fifo_order() {
        let queue = redis_queue(QueueOptions::default()).await;
        let ids = [push(&queue, None).await, push(&queue, None).await, push(&queue, None).await];

        let duplicate = queue
            .enqueue(ids[0], entry(3).payload, EnqueueOptions::default())
            .await
            .unwrap();
        assert!(!duplicate);

        for id in ids {
            assert_eq!(queue.claim().await.unwrap().unwrap().job_id, id);
        }
        assert!(queue.claim().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap().in_flight, 3);

        queue.drain().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a Redis server"]
    async fn test_redis_concurrent_claims_hand_out_each_entry_once() {
        let queue = redis_queue(QueueOptions::default()).await;
        for _ in 0..20 {
            push(&queue, None).await;
        }

        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let queue = queue.clone();
            workers.spawn(async move {
                let mut claimed = Vec::new();
                while let Some(entry) = queue.claim().await.unwrap() {
                    claimed.push(entry.job_id);
                }
                claimed
            });
        }

        let mut all = Vec::new();
        while let Some(claimed) = workers.join_next().await {
            all.extend(claimed.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);

        queue.drain().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a Redis server"]
    async fn test_redis_expired_claim_returns_to_the_head() {
        let queue = redis_queue(QueueOptions {
            visibility_timeout: Duration::from_millis(200),
            ..QueueOptions::default()
        })
        .await;
        let first = push(&queue, None).await;
        let second = push(&queue, None).await;

        assert_eq!(queue.claim().await.unwrap().unwrap().job_id, first);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(queue.claim().await.unwrap().unwrap().job_id, first);
        assert_eq!(queue.claim().await.unwrap().unwrap().job_id, second);

        queue.drain().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a Redis server"]
    async fn test_redis_nack_retries_then_dead_letters() {
        let queue = redis_queue(QueueOptions {
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
            ..QueueOptions::default()
        })
        .await;
        let id = push(&queue, Some(2)).await;

        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(
            queue.nack(&claimed, "store down").await.unwrap(),
            NackOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(50)
            }
        );
        assert!(queue.claim().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let retried = queue.claim().await.unwrap().unwrap();
        assert_eq!(retried.job_id, id);
        assert_eq!(retried.metadata.attempts, 1);

        assert_eq!(
            queue.nack(&retried, "store still down").await.unwrap(),
            NackOutcome::DeadLettered { attempts: 2 }
        );
        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].metadata.last_failure_reason.as_deref(), Some("store still down"));

        let depth = queue.depth().await.unwrap();
        assert_eq!((depth.in_flight, depth.delayed, depth.dead), (0, 0, 1));
        assert!(queue.claim().await.unwrap().is_none());

        queue.drain().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a Redis server"]
    async fn test_redis_ack_prunes_old_completed_entries() {
        let queue = redis_queue(QueueOptions {
            keep_completed: Retention {
                count: 2,
                age: Duration::from_secs(3600),
            },
            ..QueueOptions::default()
        })
        .await;
        for _ in 0..4 {
            push(&queue, None).await;
            let claimed = queue.claim().await.unwrap().unwrap();
            queue.ack(&claimed).await.unwrap();
        }

        let depth = queue.depth().await.unwrap();
        assert_eq!((depth.in_flight, depth.completed), (0, 2));

        queue.drain().await.unwrap();
    }
}
