use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Job State Machine
/// PENDING → RUNNING → {COMPLETED, FAILED}
/// No transition skips RUNNING and no transition reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Parse a status from string (case-insensitive)
    pub fn parse(s: &str) -> Option<JobStatus> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry metadata carried by every queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub attempts: u8,
    pub max_attempts: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

impl Default for JobMetadata {
    fn default() -> Self {
        Self {
            attempts: 0,
            max_attempts: 3,
            last_failure_reason: None,
        }
    }
}

/// Minimal payload a worker needs to run a job.
/// Kept apart from the job record so the queue never holds results or logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePayload {
    pub code: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub timeout_ms: u64,
}

/// Durable queue entry: job id + payload + retry bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub payload: QueuePayload,
    #[serde(default)]
    pub metadata: JobMetadata,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job_id: Uuid, payload: QueuePayload, max_attempts: u8) -> Self {
        Self {
            job_id,
            payload,
            metadata: JobMetadata {
                max_attempts,
                ..JobMetadata::default()
            },
            enqueued_at: Utc::now(),
        }
    }
}

/// Per-job isolation limits handed to the launcher
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu_share: f64,
    pub memory_mb: u64,
    pub timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_share: 1.0,
            memory_mb: 512,
            timeout_ms: 30_000,
        }
    }
}

/// The single message written to the sandbox runner's stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerInput {
    pub code: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Execution Output
/// Written by the sandbox runner on stdout, returned by the launcher.
///
/// `result` distinguishes an absent key from an explicit `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub execution_time: f64,
}

impl ExecutionResult {
    pub fn success(result: Option<Value>, logs: String, elapsed: Duration) -> Self {
        Self {
            success: true,
            result,
            error: None,
            logs,
            execution_time: elapsed.as_secs_f64() * 1000.0,
        }
    }

    pub fn failure(error: impl Into<String>, logs: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            logs,
            execution_time: elapsed.as_secs_f64() * 1000.0,
        }
    }

    /// Execution time rounded to whole milliseconds, never negative
    pub fn execution_time_ms(&self) -> u64 {
        if self.execution_time.is_finite() && self.execution_time > 0.0 {
            self.execution_time.round() as u64
        } else {
            0
        }
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Job Record
/// Created PENDING by the submission path, mutated only through `apply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub code: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub timeout_ms: u64,
    pub status: JobStatus,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub result: Option<Value>,
    #[serde(default)]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(code: String, args: Vec<Value>, timeout_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            args,
            timeout_ms,
            status: JobStatus::Pending,
            result: None,
            logs: String::new(),
            error: None,
            execution_time_ms: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn payload(&self) -> QueuePayload {
        QueuePayload {
            code: self.code.clone(),
            args: self.args.clone(),
            timeout_ms: self.timeout_ms,
        }
    }

    /// Apply a state transition in place.
    ///
    /// Re-applying RUNNING to a running job, or any terminal transition to a
    /// terminal job, is a no-op: the first application wins.
    pub fn apply(&mut self, transition: &JobTransition) -> Result<Applied, TransitionError> {
        match (self.status, transition) {
            (JobStatus::Pending, JobTransition::Start { at }) => {
                self.status = JobStatus::Running;
                self.started_at = Some(*at);
                Ok(Applied::Changed)
            }
            (JobStatus::Running, JobTransition::Start { .. }) => Ok(Applied::Unchanged),
            (
                JobStatus::Running,
                JobTransition::Finish {
                    outcome,
                    logs,
                    execution_time_ms,
                    at,
                },
            ) => {
                match outcome {
                    Outcome::Completed(value) => {
                        self.status = JobStatus::Completed;
                        self.result = Some(value.clone());
                        self.error = None;
                    }
                    Outcome::Failed(message) => {
                        self.status = JobStatus::Failed;
                        self.result = None;
                        self.error = Some(message.clone());
                    }
                }
                self.logs = logs.clone();
                self.execution_time_ms = Some(*execution_time_ms);
                self.completed_at = Some(*at);
                Ok(Applied::Changed)
            }
            (status, JobTransition::Finish { .. }) if status.is_terminal() => {
                Ok(Applied::Unchanged)
            }
            (from, transition) => Err(TransitionError::Invalid {
                from,
                to: transition.target(),
            }),
        }
    }
}

/// Terminal outcome of a sandboxed run
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Failed(String),
}

/// Typed partial update of a job record.
/// Each variant carries every field that must change together.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    Start {
        at: DateTime<Utc>,
    },
    Finish {
        outcome: Outcome,
        logs: String,
        execution_time_ms: u64,
        at: DateTime<Utc>,
    },
}

impl JobTransition {
    pub fn start() -> Self {
        JobTransition::Start { at: Utc::now() }
    }

    /// Build the terminal transition for a launcher result
    pub fn finish(result: ExecutionResult) -> Self {
        let execution_time_ms = result.execution_time_ms();
        let outcome = if result.success {
            Outcome::Completed(result.result.unwrap_or(Value::Null))
        } else {
            Outcome::Failed(
                result
                    .error
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string()),
            )
        };

        JobTransition::Finish {
            outcome,
            logs: result.logs,
            execution_time_ms,
            at: Utc::now(),
        }
    }

    /// Terminal failure not produced by the sandbox (e.g. retries exhausted)
    pub fn fail(error: impl Into<String>) -> Self {
        JobTransition::Finish {
            outcome: Outcome::Failed(error.into()),
            logs: String::new(),
            execution_time_ms: 0,
            at: Utc::now(),
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Start { .. } => JobStatus::Running,
            JobTransition::Finish {
                outcome: Outcome::Completed(_),
                ..
            } => JobStatus::Completed,
            JobTransition::Finish {
                outcome: Outcome::Failed(_),
                ..
            } => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid job transition {from} -> {to}")]
    Invalid { from: JobStatus, to: JobStatus },
}

/// Status fields pushed to observers on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for StatusUpdate {
    fn from(job: &Job) -> Self {
        let terminal = job.status.is_terminal();
        Self {
            job_id: job.id,
            status: job.status,
            result: job.result.clone(),
            error: job.error.clone(),
            logs: terminal.then(|| job.logs.clone()),
            execution_time_ms: job.execution_time_ms,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Client submission, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub code: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Requested timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Logs and error of a single job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogs {
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One page of job records, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub pages: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_job() -> Job {
        let mut job = Job::new("function main() {}".to_string(), vec![], 30_000);
        job.apply(&JobTransition::start()).unwrap();
        job
    }

    #[test]
    fn test_job_status_serialization() {
        let json = serde_json::to_string(&JobStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");

        let status: JobStatus = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(status, JobStatus::Running);
    }

    #[test]
    fn test_job_status_parse() {
        assert_eq!(JobStatus::parse("pending"), Some(JobStatus::Pending));
        assert_eq!(JobStatus::parse("FAILED"), Some(JobStatus::Failed));
        assert_eq!(JobStatus::parse("queued"), None);
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let job = Job::new("x".to_string(), vec![json!(1)], 5000);
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["timeoutMs"], 5000);
        assert!(value.get("createdAt").is_some());
        assert!(value.get("result").is_none());
        assert!(value.get("startedAt").is_none());
    }

    #[test]
    fn test_null_result_survives_round_trip() {
        let mut job = running_job();
        job.apply(&JobTransition::finish(ExecutionResult::success(
            None,
            String::new(),
            Duration::from_millis(3),
        )))
        .unwrap();
        assert_eq!(job.result, Some(Value::Null));

        let json = serde_json::to_string(&job).unwrap();
        let restored: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.result, Some(Value::Null));
        assert_eq!(restored, job);
    }

    #[test]
    fn test_start_sets_started_at_once() {
        let mut job = Job::new("x".to_string(), vec![], 1000);
        assert_eq!(job.apply(&JobTransition::start()).unwrap(), Applied::Changed);
        let started = job.started_at;
        assert!(started.is_some());

        assert_eq!(
            job.apply(&JobTransition::start()).unwrap(),
            Applied::Unchanged
        );
        assert_eq!(job.started_at, started);
    }

    #[test]
    fn test_finish_cannot_skip_running() {
        let mut job = Job::new("x".to_string(), vec![], 1000);
        let err = job.apply(&JobTransition::fail("nope")).unwrap_err();

        assert_eq!(
            err,
            TransitionError::Invalid {
                from: JobStatus::Pending,
                to: JobStatus::Failed
            }
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_terminal_update_is_idempotent() {
        let mut job = running_job();
        let transition = JobTransition::finish(ExecutionResult::success(
            Some(json!(8)),
            "hello\n".to_string(),
            Duration::from_millis(12),
        ));

        assert_eq!(job.apply(&transition).unwrap(), Applied::Changed);
        let after_first = job.clone();

        assert_eq!(job.apply(&transition).unwrap(), Applied::Unchanged);
        assert_eq!(job, after_first);

        // A different terminal payload does not overwrite the first either
        assert_eq!(
            job.apply(&JobTransition::fail("late")).unwrap(),
            Applied::Unchanged
        );
        assert_eq!(job, after_first);
    }

    #[test]
    fn test_terminal_cannot_reverse() {
        let mut job = running_job();
        job.apply(&JobTransition::fail("boom")).unwrap();

        let err = job.apply(&JobTransition::start()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Invalid {
                from: JobStatus::Failed,
                to: JobStatus::Running
            }
        );
    }

    #[test]
    fn test_exactly_one_of_result_or_error() {
        let mut completed = running_job();
        completed
            .apply(&JobTransition::finish(ExecutionResult::success(
                Some(json!({"sum": 8})),
                String::new(),
                Duration::from_millis(1),
            )))
            .unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.result.is_some() && completed.error.is_none());
        assert!(completed.execution_time_ms.is_some());

        let mut failed = running_job();
        failed
            .apply(&JobTransition::finish(ExecutionResult::failure(
                "boom",
                "[ERROR] boom\n".to_string(),
                Duration::from_millis(1),
            )))
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.result.is_none());
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(failed.logs, "[ERROR] boom\n");
    }

    #[test]
    fn test_failure_without_message_gets_placeholder() {
        let result = ExecutionResult {
            success: false,
            result: None,
            error: None,
            logs: String::new(),
            execution_time: 1.0,
        };

        match JobTransition::finish(result) {
            JobTransition::Finish {
                outcome: Outcome::Failed(message),
                ..
            } => assert_eq!(message, "Unknown error"),
            other => panic!("unexpected transition: {:?}", other),
        }
    }

    #[test]
    fn test_execution_result_wire_format() {
        let raw = r#"{"success":true,"result":8,"logs":"a\n","executionTime":1.75}"#;
        let parsed: ExecutionResult = serde_json::from_str(raw).unwrap();

        assert!(parsed.success);
        assert_eq!(parsed.result, Some(json!(8)));
        assert_eq!(parsed.execution_time_ms(), 2);

        let failure = ExecutionResult::failure("boom", String::new(), Duration::ZERO);
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["error"], "boom");
        assert!(value.get("result").is_none());
        assert_eq!(value["executionTime"], 0.0);
    }

    #[test]
    fn test_negative_execution_time_clamps_to_zero() {
        let mut result = ExecutionResult::failure("x", String::new(), Duration::ZERO);
        result.execution_time = -4.0;
        assert_eq!(result.execution_time_ms(), 0);
    }

    #[test]
    fn test_status_update_from_job() {
        let pending = Job::new("x".to_string(), vec![], 1000);
        let update = StatusUpdate::from(&pending);
        assert_eq!(update.status, JobStatus::Pending);
        assert!(update.logs.is_none());

        let mut done = running_job();
        done.apply(&JobTransition::fail("boom")).unwrap();
        let update = StatusUpdate::from(&done);
        assert_eq!(update.job_id, done.id);
        assert_eq!(update.error.as_deref(), Some("boom"));
        assert_eq!(update.logs.as_deref(), Some(""));
        assert!(update.completed_at.is_some());
    }

    #[test]
    fn test_queue_entry_defaults_metadata() {
        let raw = r#"{
            "jobId": "6f1c6f0e-3f2b-4a8e-9a55-0c1b2d3e4f50",
            "payload": {"code": "x", "timeoutMs": 1000},
            "enqueuedAt": "2025-01-01T00:00:00Z"
        }"#;
        let entry: QueueEntry = serde_json::from_str(raw).unwrap();

        assert_eq!(entry.metadata, JobMetadata::default());
        assert!(entry.payload.args.is_empty());
    }
}
