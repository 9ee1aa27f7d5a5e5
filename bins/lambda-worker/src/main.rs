mod capture;
mod dispatcher;
mod executor;
mod health;
mod launcher;
mod rate_limit;

use anyhow::Context;
use lambda_common::publisher::RedisPublisher;
use lambda_common::queue::{JobQueue, QueueOptions, RedisQueue};
use lambda_common::store::RedisJobStore;
use lambda_common::Config;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::dispatcher::{Dispatcher, DispatcherOptions};
use crate::executor::JobExecutor;
use crate::health::HealthState;
use crate::launcher::DockerLauncher;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Lambda worker booting...");
    let config = Config::from_env();

    let redis_conn = lambda_common::redis::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    info!("Connected to Redis: {}", config.redis_url);

    let launcher = DockerLauncher::connect(config.sandbox_image.clone())?;
    match launcher.ensure_image().await {
        Ok(()) => info!("Sandbox image ready: {}", launcher.image()),
        Err(e) => warn!(
            image = %launcher.image(),
            error = %format!("{:#}", e),
            "Sandbox image unavailable; jobs will fail until it is built"
        ),
    }

    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        redis_conn.clone(),
        QueueOptions::from_config(&config),
    ));
    let executor = Arc::new(JobExecutor::new(
        Arc::new(RedisJobStore::new(redis_conn.clone())),
        queue.clone(),
        Arc::new(launcher),
        Arc::new(RedisPublisher::new(redis_conn)),
        config.clone(),
    ));
    let limiter = Arc::new(RateLimiter::per_second(config.rate_limit_per_sec));
    let dispatcher = Dispatcher::new(executor, limiter, DispatcherOptions::from_config(&config));

    let health_state = Arc::new(HealthState {
        stats: dispatcher.stats(),
        queue,
        start_time: Instant::now(),
    });
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_state).await {
            error!(error = %e, "Health server stopped");
        }
    });

    info!(
        concurrency = config.concurrency,
        rate_limit_per_sec = config.rate_limit_per_sec,
        "Listening for jobs"
    );

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, draining in-flight jobs..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await;

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
