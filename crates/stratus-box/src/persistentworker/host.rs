use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use stratus_core::{Result, SharedLogger, StratusError};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::runconfig::RunConfig;
use crate::traits::Instance;

const DEFAULT_AGENT_BINARY: &str = "stratus-agent";

/// Runs the agent directly on the worker host, inside a scratch directory.
pub struct HostAgent {
    agent_binary: PathBuf,
    temp_dir: PathBuf,
    logger: SharedLogger,
    dirty: AtomicBool,
}

impl HostAgent {
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            agent_binary: PathBuf::from(DEFAULT_AGENT_BINARY),
            temp_dir: std::env::temp_dir().join(format!("stratus-task-{}", Uuid::new_v4())),
            logger,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn with_agent_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.agent_binary = binary.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

#[async_trait]
impl Instance for HostAgent {
    fn kind(&self) -> &'static str {
        "none"
    }

    #[instrument(skip(self, cancel, config), fields(task = config.task_id))]
    async fn run(&self, cancel: &CancellationToken, config: &RunConfig) -> Result<()> {
        self.dirty.store(config.dirty_mode, Ordering::SeqCst);
        let working_dir = self.working_directory(&config.project_dir_str(), config.dirty_mode);
        tokio::fs::create_dir_all(&working_dir).await?;

        info!("Starting agent {} in {}", self.agent_binary.display(), working_dir);
        self.logger.info(&format!("Running agent on the host in {}", working_dir));

        let mut child = Command::new(&self.agent_binary)
            .args(config.agent_args("", ""))
            .envs(&config.environment)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(StratusError::Agent(format!("agent exited with {}", status)))
                }
            }
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill agent {}: {}", self.agent_binary.display(), e);
                }
                Err(StratusError::Cancelled)
            }
        }
    }

    fn working_directory(&self, project_dir: &str, dirty_mode: bool) -> String {
        if dirty_mode {
            project_dir.to_string()
        } else {
            self.temp_dir.to_string_lossy().to_string()
        }
    }

    async fn close(&self) -> Result<()> {
        if self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }

        match tokio::fs::remove_dir_all(&self.temp_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to clean up {}: {}", self.temp_dir.display(), e);
                Err(e.into())
            }
        }
    }
}
