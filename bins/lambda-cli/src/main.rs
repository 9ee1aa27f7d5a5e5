mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "lambda-cli")]
#[command(about = "Lambda CLI - Submit jobs, inspect results and manage the queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a code snippet for execution
    Submit {
        /// Inline source code
        #[arg(short, long, conflicts_with = "file")]
        code: Option<String>,

        /// Read source code from a file
        #[arg(short, long)]
        file: Option<String>,

        /// Arguments for main() as a JSON array (e.g. '[5, 3]')
        #[arg(short, long, default_value = "[]")]
        args: String,

        /// Timeout in milliseconds (clamped by the server config)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Poll until the job reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// Show a job record
    Status {
        /// Job id
        id: Uuid,
    },

    /// Print the logs of a job
    Logs {
        /// Job id
        id: Uuid,
    },

    /// List jobs, newest first
    List {
        #[arg(short, long, default_value = "1")]
        page: u32,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show queue depth by state
    Queue,

    /// Show dead-lettered entries
    DeadLetters {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Drain the queue and delete every job record
    Purge {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Build the sandbox Docker image
    BuildImage {
        /// Image tag (defaults to SANDBOX_IMAGE)
        #[arg(short, long)]
        tag: Option<String>,

        /// Skip build cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            code,
            file,
            args,
            timeout,
            wait,
        } => {
            commands::submit_job(code.as_deref(), file.as_deref(), &args, timeout, wait).await?;
        }
        Commands::Status { id } => {
            commands::show_status(id).await?;
        }
        Commands::Logs { id } => {
            commands::show_logs(id).await?;
        }
        Commands::List { page, limit } => {
            commands::list_jobs(page, limit).await?;
        }
        Commands::Queue => {
            commands::show_queue().await?;
        }
        Commands::DeadLetters { limit } => {
            commands::show_dead_letters(limit).await?;
        }
        Commands::Purge { yes } => {
            commands::purge(yes).await?;
        }
        Commands::BuildImage { tag, no_cache } => {
            commands::build_docker_image(tag.as_deref(), no_cache).await?;
        }
    }

    Ok(())
}
