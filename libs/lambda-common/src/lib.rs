pub mod config;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod redis;
pub mod store;
pub mod submit;
pub mod types;
pub mod validation;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{QueueError, StoreError, SubmitError, ValidationError};
pub use queue::{JobQueue, QueueOptions, RedisQueue};
pub use store::{JobStore, RedisJobStore};
pub use types::{ExecutionResult, Job, JobStatus, JobTransition, ResourceLimits, StatusUpdate};
