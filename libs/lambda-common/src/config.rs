use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::types::ResourceLimits;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub sandbox_image: String,
    /// Concurrent worker slots in the dispatcher
    pub concurrency: usize,
    /// New job starts allowed per rolling second
    pub rate_limit_per_sec: u32,
    pub default_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub cpu_share: f64,
    pub memory_mb: u64,
    pub max_code_chars: usize,
    pub max_attempts: u8,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Added to `max_timeout_ms` to get the queue visibility timeout
    pub visibility_margin_ms: u64,
    pub poll_interval_ms: u64,
    pub health_port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            sandbox_image: env::var("SANDBOX_IMAGE")
                .unwrap_or_else(|_| "lambda-lite-sandbox:latest".to_string()),
            concurrency: env_or("WORKER_CONCURRENCY", 5),
            rate_limit_per_sec: env_or("WORKER_RATE_LIMIT", 10),
            default_timeout_ms: env_or("DEFAULT_TIMEOUT_MS", 30_000),
            min_timeout_ms: env_or("MIN_TIMEOUT_MS", 1_000),
            max_timeout_ms: env_or("MAX_TIMEOUT_MS", 300_000),
            cpu_share: env_or("SANDBOX_CPUS", 1.0),
            memory_mb: env_or("SANDBOX_MEMORY_MB", 512),
            max_code_chars: env_or("MAX_CODE_CHARS", 50_000),
            max_attempts: env_or("QUEUE_MAX_ATTEMPTS", 3),
            backoff_base_ms: env_or("QUEUE_BACKOFF_MS", 2_000),
            backoff_max_ms: env_or("QUEUE_BACKOFF_MAX_MS", 60_000),
            visibility_margin_ms: env_or("QUEUE_VISIBILITY_MARGIN_MS", 30_000),
            poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", 500),
            health_port: env_or("HEALTH_PORT", 8081),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    /// Resource limits for a job with the given (already clamped) timeout
    pub fn limits_for(&self, timeout_ms: u64) -> ResourceLimits {
        ResourceLimits {
            cpu_share: self.cpu_share,
            memory_mb: self.memory_mb,
            timeout_ms: self.clamp_timeout(Some(timeout_ms)),
        }
    }

    /// Apply the default and clamp a requested timeout into [min, max]
    pub fn clamp_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_timeout_ms)
            .clamp(self.min_timeout_ms, self.max_timeout_ms.max(self.min_timeout_ms))
    }

    /// Claimed entries become reclaimable after this long.
    /// Always exceeds the longest sandbox run a client can request.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms + self.visibility_margin_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
