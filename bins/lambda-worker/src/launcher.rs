//! Resource-Limited Process Launcher
//!
//! **Core Responsibility:**
//! Run one sandbox runner per job inside a throwaway container and turn
//! whatever happens into an `ExecutionResult`.
//!
//! **Container Rules:**
//! - No network, read-only root filesystem, all capabilities dropped
//! - Memory ceiling without swap, CPU share via nano-CPUs
//! - stdio attached before start so no early output is lost
//! - Hard wall-clock timeout, container killed on expiry
//! - Container force-removed on every exit path
//!
//! The launcher never fails: launch errors, crashes and timeouts all come
//! back as `success: false` results.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use lambda_common::types::{ExecutionResult, ResourceLimits, RunnerInput};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant as Deadline;

use crate::capture::{spawn_capture, wait_or_timeout, Chunk, Exit, OutputBuffer};

/// How long to keep reading output after the container is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// Budget for create, attach, start and stdin together, and for each cleanup call.
/// Both together stay below the queue's visibility margin.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);
const PIDS_LIMIT: i64 = 64;
const SANDBOX_LABEL: &str = "lambda-lite.sandbox";

/// Executes code in an isolated sandbox.
///
/// Implementations must respect `limits.timeout_ms` and must release every
/// resource they created before returning.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn execute(&self, code: &str, args: &[Value], limits: &ResourceLimits) -> ExecutionResult;
}

pub struct DockerLauncher {
    docker: Docker,
    image: String,
}

impl DockerLauncher {
    pub fn new(docker: Docker, image: impl Into<String>) -> Self {
        Self {
            docker,
            image: image.into(),
        }
    }

    pub fn connect(image: impl Into<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self::new(docker, image))
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Pull the sandbox image if it is not present locally
    pub async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = %self.image, "sandbox image not found locally, pulling");
        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull sandbox image")?;
        }
        Ok(())
    }

    fn container_config(&self, limits: &ResourceLimits) -> Config<String> {
        let memory_bytes = i64::try_from(limits.memory_mb)
            .unwrap_or(i64::MAX)
            .saturating_mul(1024 * 1024);
        let nano_cpus = (limits.cpu_share.max(0.0) * 1e9) as i64;
        let heap_mb = (limits.memory_mb * 3 / 4).max(16);

        Config {
            image: Some(self.image.clone()),
            env: Some(vec![
                format!("LAMBDA_RUNNER_TIMEOUT_MS={}", limits.timeout_ms),
                format!("LAMBDA_RUNNER_HEAP_MB={}", heap_mb),
            ]),
            labels: Some(HashMap::from([(SANDBOX_LABEL.to_string(), "true".to_string())])),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                nano_cpus: Some(nano_cpus),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                pids_limit: Some(PIDS_LIMIT),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run(
        &self,
        container_id: &str,
        input: &[u8],
        limits: &ResourceLimits,
        started: Instant,
        setup_deadline: Deadline,
    ) -> Result<ExecutionResult> {
        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        let AttachContainerResults {
            output,
            input: mut stdin,
        } = within(
            setup_deadline,
            "attach to container",
            self.docker.attach_container(container_id, Some(attach_options)),
        )
        .await?;

        let buffer = OutputBuffer::default();
        let demuxed = Box::pin(output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(Chunk::Stdout(message.to_vec())))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(Chunk::Stderr(message.to_vec()))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(e)),
            }
        }));
        let mut capture = spawn_capture(demuxed, buffer.clone());

        within(
            setup_deadline,
            "start container",
            self.docker
                .start_container(container_id, None::<StartContainerOptions<String>>),
        )
        .await?;

        within(setup_deadline, "write runner input", stdin.write_all(input)).await?;
        within(setup_deadline, "close runner input", stdin.shutdown()).await?;
        drop(stdin);

        let limit = Duration::from_millis(limits.timeout_ms);
        match wait_or_timeout(self.wait_exit(container_id), limit).await {
            Exit::TimedOut => {
                tracing::warn!(
                    container_id,
                    timeout_ms = limits.timeout_ms,
                    "execution timeout, killing container"
                );
                let kill = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>);
                if let Err(e) = within(Deadline::now() + CLEANUP_TIMEOUT, "kill container", kill).await {
                    tracing::warn!(container_id, error = %format!("{:#}", e), "failed to kill container");
                }
                let _ = tokio::time::timeout(DRAIN_GRACE, &mut capture).await;

                Ok(ExecutionResult::failure(
                    format!("Execution timeout ({}ms)", limits.timeout_ms),
                    buffer.combined(),
                    started.elapsed(),
                ))
            }
            Exit::Completed(exit_code) => {
                let _ = tokio::time::timeout(DRAIN_GRACE, &mut capture).await;
                let elapsed = started.elapsed();
                tracing::debug!(
                    container_id,
                    exit_code,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "container finished"
                );
                Ok(parse_envelope(&buffer.stdout(), &buffer.stderr(), elapsed))
            }
        }
    }

    /// Exit code of the container once it stops running
    async fn wait_exit(&self, container_id: &str) -> i64 {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                tracing::warn!(container_id, error = %e, "waiting on container failed");
                -1
            }
            None => -1,
        }
    }

    async fn remove(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let remove = self.docker.remove_container(container_id, Some(options));
        if let Err(e) = within(Deadline::now() + CLEANUP_TIMEOUT, "remove container", remove).await {
            tracing::error!(container_id, error = %format!("{:#}", e), "failed to remove sandbox container");
        }
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    async fn execute(&self, code: &str, args: &[Value], limits: &ResourceLimits) -> ExecutionResult {
        let started = Instant::now();

        let input = RunnerInput {
            code: code.to_string(),
            args: args.to_vec(),
        };
        let input = match serde_json::to_vec(&input) {
            Ok(bytes) => bytes,
            Err(e) => return ExecutionResult::failure(e.to_string(), String::new(), started.elapsed()),
        };

        let setup_deadline = Deadline::now() + SETUP_TIMEOUT;
        let name = format!("lambda-sandbox-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let create = self
            .docker
            .create_container(Some(create_options), self.container_config(limits));
        let container_id = match within(setup_deadline, "create sandbox container", create).await {
            Ok(created) => created.id,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(error = %message, image = %self.image, "failed to create sandbox container");
                return ExecutionResult::failure(message, String::new(), started.elapsed());
            }
        };

        let result = match self.run(&container_id, &input, limits, started, setup_deadline).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(container_id = %container_id, error = %format!("{:#}", e), "sandbox execution error");
                ExecutionResult::failure(format!("{:#}", e), String::new(), started.elapsed())
            }
        };

        self.remove(&container_id).await;
        result
    }
}

/// Run one Docker call against a deadline so a stuck daemon cannot hold a claim
async fn within<T, E>(deadline: Deadline, step: &str, call: impl Future<Output = Result<T, E>>) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result.with_context(|| format!("Failed to {}", step)),
        Err(_) => anyhow::bail!("Timed out trying to {}", step),
    }
}

/// Interpret the runner's stdout as its result envelope.
///
/// Execution time is always the launcher's own measurement; stderr is
/// diagnostic only and gets appended to the logs.
pub fn parse_envelope(stdout: &str, stderr: &str, elapsed: Duration) -> ExecutionResult {
    match serde_json::from_str::<ExecutionResult>(stdout.trim()) {
        Ok(mut result) => {
            result.execution_time = elapsed.as_secs_f64() * 1000.0;
            result.logs.push_str(stderr);
            result
        }
        Err(e) => {
            tracing::debug!(error = %e, "runner output is not a result envelope");
            let mut logs = stdout.to_string();
            logs.push_str(stderr);
            ExecutionResult::failure("Failed to parse execution result", logs, elapsed)
        }
    }
}
