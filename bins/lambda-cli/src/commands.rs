// CLI commands for operating Lambda
use anyhow::{bail, Context, Result};
use lambda_common::queue::{JobQueue, QueueOptions, RedisQueue};
use lambda_common::store::{JobStore, RedisJobStore};
use lambda_common::types::{Job, JobStatus, Submission};
use lambda_common::{Config, StoreError};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Redis-backed store and queue built from the environment
struct Backend {
    config: Config,
    store: RedisJobStore,
    queue: RedisQueue,
}

async fn connect() -> Result<Backend> {
    let config = Config::from_env();
    let conn = lambda_common::redis::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;

    Ok(Backend {
        store: RedisJobStore::new(conn.clone()),
        queue: RedisQueue::new(conn, QueueOptions::from_config(&config)),
        config,
    })
}

/// Pick the code source: inline `--code` or the contents of `--file`
fn read_code(code: Option<&str>, file: Option<&str>) -> Result<String> {
    match (code, file) {
        (Some(code), _) => Ok(code.to_string()),
        (None, Some(path)) => fs::read_to_string(Path::new(path))
            .with_context(|| format!("Failed to read {}", path)),
        (None, None) => bail!("Provide code with --code or --file"),
    }
}

fn parse_args(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(raw).context("--args must be valid JSON")? {
        Value::Array(items) => Ok(items),
        other => bail!("--args must be a JSON array, got {}", other),
    }
}

async fn get_job(store: &RedisJobStore, id: Uuid) -> Result<Job> {
    match store.get(id).await {
        Ok(job) => Ok(job),
        Err(StoreError::NotFound(_)) => bail!("Job {} not found", id),
        Err(e) => Err(e.into()),
    }
}

/// Submit a snippet, optionally waiting for its outcome
pub async fn submit_job(
    code: Option<&str>,
    file: Option<&str>,
    args: &str,
    timeout: Option<u64>,
    wait: bool,
) -> Result<()> {
    let submission = Submission {
        code: read_code(code, file)?,
        args: parse_args(args)?,
        timeout,
    };

    let backend = connect().await?;
    let job = lambda_common::submit::submit(&backend.store, &backend.queue, submission, &backend.config)
        .await
        .context("Submission rejected")?;

    println!("🚀 Job submitted: {}", job.id);
    println!("⏱️  Timeout: {}ms", job.timeout_ms);

    if !wait {
        println!("\n💡 Check progress with: lambda-cli status {}", job.id);
        return Ok(());
    }

    // Every attempt may run to its timeout, plus backoff between attempts
    let budget = Duration::from_millis(job.timeout_ms) * u32::from(backend.config.max_attempts.max(1))
        + Duration::from_millis(backend.config.backoff_max_ms) * u32::from(backend.config.max_attempts)
        + Duration::from_secs(30);
    let started = Instant::now();
    let mut last_status = job.status;

    println!("\n⏳ Waiting for result...");
    loop {
        let current = get_job(&backend.store, job.id).await?;
        if current.status != last_status {
            println!("  → {}", current.status.as_str());
            last_status = current.status;
        }
        if current.status.is_terminal() {
            println!();
            print_job(&current);
            return Ok(());
        }
        if started.elapsed() > budget {
            bail!("Gave up waiting for job {} after {:?}", job.id, started.elapsed());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_job(job: &Job) {
    let icon = match job.status {
        JobStatus::Completed => "✅",
        JobStatus::Failed => "❌",
        JobStatus::Running => "🏃",
        JobStatus::Pending => "⏳",
    };
    println!("{} Job {} ({})", icon, job.id, job.status.as_str());
    println!("  Created:   {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        println!("  Started:   {}", started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("  Completed: {}", completed.to_rfc3339());
    }
    if let Some(ms) = job.execution_time_ms {
        println!("  Duration:  {}ms", ms);
    }
    match &job.result {
        Some(result) => println!("  Result:    {}", result),
        None if job.status == JobStatus::Completed => println!("  Result:    (none)"),
        None => {}
    }
    if let Some(error) = &job.error {
        println!("  Error:     {}", error);
    }
    if !job.logs.is_empty() {
        println!("\n📜 Logs:");
        print!("{}", job.logs);
        if !job.logs.ends_with('\n') {
            println!();
        }
    }
}

/// Show a job record
pub async fn show_status(id: Uuid) -> Result<()> {
    let backend = connect().await?;
    let job = get_job(&backend.store, id).await?;
    print_job(&job);
    Ok(())
}

/// Print the logs of a job
pub async fn show_logs(id: Uuid) -> Result<()> {
    let backend = connect().await?;
    let logs = match backend.store.logs(id).await {
        Ok(logs) => logs,
        Err(StoreError::NotFound(_)) => bail!("Job {} not found", id),
        Err(e) => return Err(e.into()),
    };

    if logs.logs.is_empty() {
        println!("(no logs)");
    } else {
        print!("{}", logs.logs);
    }
    if let Some(error) = logs.error {
        println!("\n❌ Error: {}", error);
    }
    Ok(())
}

/// List jobs, newest first
pub async fn list_jobs(page: u32, limit: u32) -> Result<()> {
    let backend = connect().await?;
    let listing = backend.store.list(page.max(1), limit.clamp(1, 100)).await?;

    if listing.jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!("📋 Jobs (page {}/{}):\n", listing.page, listing.pages);
    println!("{:<38} {:<10} {:<27} {:<10}", "Id", "Status", "Created", "Duration");
    println!("{}", "─".repeat(88));

    for job in &listing.jobs {
        let duration = job
            .execution_time_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<10} {:<27} {:<10}",
            job.id,
            job.status.as_str(),
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            duration
        );
    }

    println!("\n✅ Total: {} job(s)", listing.total);
    Ok(())
}

/// Show queue depth by state
pub async fn show_queue() -> Result<()> {
    let backend = connect().await?;
    let depth = backend.queue.depth().await?;

    println!("📊 Queue '{}':\n", backend.queue.options().name);
    println!("  Pending:   {}", depth.pending);
    println!("  Delayed:   {}", depth.delayed);
    println!("  In flight: {}", depth.in_flight);
    println!("  Completed: {}", depth.completed);
    println!("  Dead:      {}", depth.dead);
    Ok(())
}

/// Show dead-lettered entries
pub async fn show_dead_letters(limit: usize) -> Result<()> {
    let backend = connect().await?;
    let entries = backend.queue.dead_letters(limit).await?;

    if entries.is_empty() {
        println!("No dead-lettered jobs.");
        return Ok(());
    }

    println!("☠️  Dead letters:\n");
    for entry in &entries {
        println!(
            "{}  attempts {}/{}  enqueued {}",
            entry.job_id,
            entry.metadata.attempts,
            entry.metadata.max_attempts,
            entry.enqueued_at.to_rfc3339()
        );
        if let Some(reason) = &entry.metadata.last_failure_reason {
            println!("  └─ {}", reason);
        }
    }
    println!("\n✅ Total: {} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
    Ok(())
}

/// Drain the queue and delete every job record
pub async fn purge(yes: bool) -> Result<()> {
    if !yes {
        print!("⚠️  This will remove:\n");
        print!("  - Every queue entry (pending, delayed, in flight, dead)\n");
        print!("  - Every job record with its result and logs\n");
        print!("\nContinue? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    let backend = connect().await?;
    println!("🧹 Draining queue...");
    backend.queue.drain().await?;
    println!("🗑️  Deleting job records...");
    let deleted = backend.store.delete_all().await?;

    println!("✅ Purged {} job(s)", deleted);
    Ok(())
}

/// Build the sandbox image from docker/sandbox/Dockerfile
pub async fn build_docker_image(tag: Option<&str>, no_cache: bool) -> Result<()> {
    let image = match tag {
        Some(tag) => tag.to_string(),
        None => Config::from_env().sandbox_image,
    };
    let dockerfile_path = Path::new("docker/sandbox/Dockerfile");

    if !dockerfile_path.exists() {
        bail!(
            "Dockerfile not found at {}. Run this from the workspace root.",
            dockerfile_path.display()
        );
    }

    println!("🐳 Building sandbox image: {}", image);
    println!("📄 Dockerfile: {}", dockerfile_path.display());

    let mut docker_args = vec![
        "build".to_string(),
        "-t".to_string(),
        image.clone(),
        "-f".to_string(),
        dockerfile_path.to_string_lossy().to_string(),
    ];

    if no_cache {
        docker_args.push("--no-cache".to_string());
    }

    docker_args.push(".".to_string());

    println!("\n🔨 Running: docker {}", docker_args.join(" "));
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    let status = Command::new("docker")
        .args(&docker_args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to execute docker build. Is Docker installed and running?")?;

    if !status.success() {
        bail!("Docker build failed with exit code: {:?}", status.code());
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Sandbox image built: {}", image);
    println!("\n💡 Workers pick it up via SANDBOX_IMAGE={}", image);

    Ok(())
}
