//! Fire-and-forget status notifications.
//!
//! Publishing never blocks job processing and never fails it: a dropped
//! update is logged and forgotten, the job record stays authoritative.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use crate::redis::UPDATES_CHANNEL;
use crate::types::StatusUpdate;

pub trait UpdatePublisher: Send + Sync {
    fn publish(&self, update: StatusUpdate);
}

/// Publishes JSON updates on the Redis pub/sub channel
#[derive(Clone)]
pub struct RedisPublisher {
    conn: ConnectionManager,
    channel: String,
}

impl RedisPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            channel: UPDATES_CHANNEL.to_string(),
        }
    }
}

impl UpdatePublisher for RedisPublisher {
    fn publish(&self, update: StatusUpdate) {
        let payload = match serde_json::to_string(&update) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(job_id = %update.job_id, error = %e, "could not encode status update");
                return;
            }
        };

        let mut conn = self.conn.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.publish::<_, _, ()>(&channel, payload).await {
                tracing::warn!(job_id = %update.job_id, status = %update.status, error = %e, "status update dropped");
            }
        });
    }
}

/// In-process fan-out; updates are lost when nobody subscribes
pub struct BroadcastPublisher {
    tx: broadcast::Sender<StatusUpdate>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }
}

impl UpdatePublisher for BroadcastPublisher {
    fn publish(&self, update: StatusUpdate) {
        // Err only means there are no receivers
        let _ = self.tx.send(update);
    }
}

pub struct NoopPublisher;

impl UpdatePublisher for NoopPublisher {
    fn publish(&self, _update: StatusUpdate) {}
}
