//! Sliding-window limit on job starts shared by all worker slots.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Allows at most `limit` acquisitions in any rolling `window`.
/// A limit of zero disables limiting.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            starts: Mutex::new(VecDeque::with_capacity(limit as usize)),
        }
    }

    pub fn per_second(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    /// Wait for a token. Waiters are served in arrival order.
    pub async fn acquire(&self) {
        if self.limit == 0 {
            return;
        }

        // Held across the sleep so later callers queue behind this one
        let mut starts = self.starts.lock().await;
        loop {
            let now = Instant::now();
            while let Some(oldest) = starts.front() {
                if now.duration_since(*oldest) >= self.window {
                    starts.pop_front();
                } else {
                    break;
                }
            }

            if starts.len() < self.limit {
                starts.push_back(now);
                return;
            }

            if let Some(oldest) = starts.front().copied() {
                tokio::time::sleep_until(oldest + self.window).await;
            }
        }
    }
}
