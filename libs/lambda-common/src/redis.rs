use redis::aio::ConnectionManager;
use uuid::Uuid;

/// Redis key layout shared by the submission path, the worker and the CLI.
/// Keeping it in one place means producers and consumers never drift.

pub const QUEUE_PREFIX: &str = "lambda:queue";
pub const JOB_PREFIX: &str = "lambda:job";
pub const JOB_INDEX: &str = "lambda:jobs";
pub const UPDATES_CHANNEL: &str = "lambda:updates";

/// The sub-structures a queue is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePart {
    /// LIST of entry ids waiting to be claimed, FIFO
    Pending,
    /// ZSET of entry ids waiting out a retry backoff, scored by ready time
    Delayed,
    /// ZSET of claimed entry ids, scored by visibility deadline
    InFlight,
    /// ZSET of acked entry ids, scored by completion time
    Completed,
    /// ZSET of dead-lettered entry ids, scored by failure time
    Dead,
    /// HASH of entry id -> serialized entry
    Entries,
}

impl QueuePart {
    pub fn all() -> &'static [QueuePart] {
        &[
            QueuePart::Pending,
            QueuePart::Delayed,
            QueuePart::InFlight,
            QueuePart::Completed,
            QueuePart::Dead,
            QueuePart::Entries,
        ]
    }

    fn suffix(&self) -> &'static str {
        match self {
            QueuePart::Pending => "pending",
            QueuePart::Delayed => "delayed",
            QueuePart::InFlight => "inflight",
            QueuePart::Completed => "completed",
            QueuePart::Dead => "dead",
            QueuePart::Entries => "entries",
        }
    }
}

/// Generate deterministic key for one part of a named queue
pub fn queue_key(queue: &str, part: QueuePart) -> String {
    format!("{}:{}:{}", QUEUE_PREFIX, queue, part.suffix())
}

/// Generate record key for a job
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Open a managed connection that reconnects on its own
pub async fn connect(redis_url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    ConnectionManager::new(client).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_naming() {
        assert_eq!(queue_key("jobs", QueuePart::Pending), "lambda:queue:jobs:pending");
        assert_eq!(queue_key("jobs", QueuePart::InFlight), "lambda:queue:jobs:inflight");
        assert_eq!(queue_key("jobs", QueuePart::Dead), "lambda:queue:jobs:dead");
    }

    #[test]
    fn test_queue_parts_are_distinct() {
        let keys: std::collections::HashSet<String> = QueuePart::all()
            .iter()
            .map(|part| queue_key("jobs", *part))
            .collect();
        assert_eq!(keys.len(), QueuePart::all().len());
    }

    #[test]
    fn test_job_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = job_key(&id);
        let key2 = job_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("lambda:job:"));
        assert!(key1.contains(&id.to_string()));
    }
}
