mod ops;
mod sandbox;

use anyhow::Context;
use lambda_common::types::{ExecutionResult, RunnerInput};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::sandbox::RunnerSettings;

/// Reads one input from stdin, writes exactly one result envelope to stdout.
/// Exit code is 0 on success and 1 otherwise.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    let result = match read_input() {
        Ok(input) => {
            let settings = RunnerSettings::from_env();
            debug!(
                timeout_ms = settings.timeout.as_millis() as u64,
                heap_bytes = settings.heap_bytes,
                code_len = input.code.len(),
                "Running snippet"
            );
            sandbox::execute(&input, &settings).await
        }
        Err(e) => ExecutionResult::failure(format!("{:#}", e), String::new(), Duration::ZERO),
    };

    let code = if result.success { 0 } else { 1 };
    if let Err(e) = write_output(&result) {
        eprintln!("Failed to write result: {:#}", e);
        std::process::exit(2);
    }
    std::process::exit(code);
}

fn read_input() -> anyhow::Result<RunnerInput> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("Failed to read input")?;
    serde_json::from_str(&raw).context("Invalid input")
}

fn write_output(result: &ExecutionResult) -> anyhow::Result<()> {
    let json = serde_json::to_string(result)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(json.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

/// Diagnostics go to stderr, which the launcher appends to the job's logs,
/// so they stay off unless LAMBDA_RUNNER_LOG is set.
fn init_tracing() {
    let Ok(directives) = std::env::var("LAMBDA_RUNNER_LOG") else {
        return;
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
