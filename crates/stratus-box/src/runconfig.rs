use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stratus_core::config::DEFAULT_AGENT_VERSION;

use crate::container::backend::ContainerBackend;
use crate::container::docker::DockerCli;

/// Parameters of a single task execution. Instances forward these to the
/// agent and otherwise leave them alone.
#[derive(Clone)]
pub struct RunConfig {
    pub task_id: i64,
    pub endpoint: String,
    pub server_secret: String,
    pub client_secret: String,
    pub project_dir: PathBuf,
    pub dirty_mode: bool,
    /// Overrides the default agent version for this run.
    pub agent_version: Option<String>,
    pub environment: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub container_backend: Arc<dyn ContainerBackend>,
}

impl RunConfig {
    pub fn new(task_id: i64, endpoint: impl Into<String>) -> Self {
        Self {
            task_id,
            endpoint: endpoint.into(),
            server_secret: String::new(),
            client_secret: String::new(),
            project_dir: PathBuf::from("."),
            dirty_mode: false,
            agent_version: None,
            environment: HashMap::new(),
            timeout: None,
            container_backend: Arc::new(DockerCli::new()),
        }
    }

    pub fn agent_version(&self) -> &str {
        self.agent_version.as_deref().unwrap_or(DEFAULT_AGENT_VERSION)
    }

    pub fn project_dir_str(&self) -> String {
        self.project_dir.to_string_lossy().to_string()
    }

    /// Command line arguments for the agent, restricted to the
    /// `command_from..command_to` range when those are non-empty.
    pub fn agent_args(&self, command_from: &str, command_to: &str) -> Vec<String> {
        let mut args = vec![
            "-api-endpoint".to_string(),
            self.endpoint.clone(),
            "-server-token".to_string(),
            self.server_secret.clone(),
            "-client-token".to_string(),
            self.client_secret.clone(),
            "-task-id".to_string(),
            self.task_id.to_string(),
        ];
        if !command_from.is_empty() {
            args.push("-command-from".to_string());
            args.push(command_from.to_string());
        }
        if !command_to.is_empty() {
            args.push("-command-to".to_string());
            args.push(command_to.to_string());
        }
        args
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("task_id", &self.task_id)
            .field("endpoint", &self.endpoint)
            .field("project_dir", &self.project_dir)
            .field("dirty_mode", &self.dirty_mode)
            .field("agent_version", &self.agent_version())
            .field("timeout", &self.timeout)
            .field("container_backend", &self.container_backend)
            .finish_non_exhaustive()
    }
}
