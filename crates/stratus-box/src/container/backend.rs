use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use stratus_core::{PortMapping, Result};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Mount {
    /// Host path or volume name.
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub working_dir: Option<String>,
    pub cpu: f32,
    /// Megabytes, 0 means unlimited.
    pub memory: u32,
    /// e.g. `linux/arm64`
    pub platform: Option<String>,
    /// Joins the network namespace of another container.
    pub network_of: Option<String>,
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone)]
pub struct ImageBuild {
    pub tag: String,
    pub dockerfile: Option<String>,
    pub context_dir: PathBuf,
    pub arguments: HashMap<String, String>,
}

/// Container runtime used by container, pipe and prebuilt instances.
#[async_trait]
pub trait ContainerBackend: Debug + Send + Sync {
    async fn volume_create(&self, name: &str) -> Result<()>;

    async fn volume_delete(&self, name: &str) -> Result<()>;

    async fn image_pull(&self, image: &str) -> Result<()>;

    async fn image_build(&self, build: &ImageBuild) -> Result<()>;

    /// Runs the container to completion and returns its exit code. The
    /// container is removed afterwards; cancellation kills it.
    async fn container_run(&self, spec: &ContainerSpec, cancel: &CancellationToken) -> Result<i32>;

    /// Starts a detached container and returns its id.
    async fn container_start(&self, spec: &ContainerSpec) -> Result<String>;

    async fn container_delete(&self, id: &str) -> Result<()>;
}
