use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use stratus_box::{execute, InstanceFactory, RunConfig};
use stratus_core::{Command, StratusConfig, TaskInstance, TracingLogger};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Runs a CI task in the execution backend it asks for")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Construct the instance described in a task file and run it
    Run {
        /// Task file (JSON)
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        task_id: i64,
        /// Agent API endpoint
        #[arg(long, default_value = "https://grpc.cirrus-ci.com:443")]
        endpoint: String,
        /// Project directory (default: current directory)
        #[arg(long)]
        project_dir: Option<PathBuf>,
        /// Work on the project directory in place instead of a copy
        #[arg(long)]
        dirty: bool,
        /// Abort the task after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print which instance a task file would get, without running it
    Describe {
        /// Task file (JSON)
        file: PathBuf,
    },
}

/// On-disk shape of a task file.
#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    instance: Option<TaskInstance>,
    #[serde(default)]
    commands: Vec<Command>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    environment: std::collections::HashMap<String, String>,
}

fn read_task(path: &PathBuf) -> anyhow::Result<TaskFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid task file {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = StratusConfig::new()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let factory = InstanceFactory::from_config(&config);

    match cli.command {
        Commands::Run {
            file,
            task_id,
            endpoint,
            project_dir,
            dirty,
            timeout,
        } => {
            let task = read_task(&file)?;
            let logger = Arc::new(TracingLogger::for_task(task_id.to_string()));
            let instance = factory.construct(
                task.instance.as_ref(),
                &task.commands,
                task.working_dir.as_deref(),
                logger,
            )?;

            let mut run_config = RunConfig::new(task_id, endpoint);
            run_config.project_dir = match project_dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            run_config.dirty_mode = dirty;
            run_config.agent_version = Some(config.agent.version.clone());
            run_config.environment = task.environment;
            run_config.timeout = timeout.map(std::time::Duration::from_secs);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, cancelling task");
                    on_signal.cancel();
                }
            });

            info!("Running task {} in a {} instance", task_id, instance.kind());
            if let Err(e) = execute(instance.as_ref(), &cancel, &run_config).await {
                error!("Task {} failed: {}", task_id, e);
                return Err(e.into());
            }
            info!("Task {} succeeded", task_id);
        }
        Commands::Describe { file } => {
            let task = read_task(&file)?;
            let logger = Arc::new(TracingLogger::new());
            let instance = factory.construct(
                task.instance.as_ref(),
                &task.commands,
                task.working_dir.as_deref(),
                logger,
            )?;

            let project_dir = std::env::current_dir()?;
            println!("instance: {}", instance.kind());
            println!(
                "working directory: {}",
                instance.working_directory(&project_dir.to_string_lossy(), false)
            );
        }
    }

    Ok(())
}
