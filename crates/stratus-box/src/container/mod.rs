pub mod backend;
pub mod docker;

use async_trait::async_trait;
use std::sync::Arc;
use stratus_core::{AdditionalContainer, Architecture, Platform, Result, StratusError};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::runconfig::RunConfig;
use crate::traits::Instance;
use backend::{ContainerBackend, ContainerSpec, Mount};

/// Runs the agent inside a container next to optional sidecar containers.
#[derive(Debug)]
pub struct Container {
    pub image: String,
    pub cpu: f32,
    pub memory: u32,
    pub additional_containers: Vec<AdditionalContainer>,
    pub platform: Arc<dyn Platform>,
    /// Only set for Linux containers.
    pub architecture: Option<Architecture>,
    pub custom_working_dir: Option<String>,
}

#[async_trait]
impl Instance for Container {
    fn kind(&self) -> &'static str {
        "container"
    }

    #[instrument(skip(self, cancel, config), fields(image = %self.image, task = config.task_id))]
    async fn run(&self, cancel: &CancellationToken, config: &RunConfig) -> Result<()> {
        let backend = config.container_backend.as_ref();
        let volume = working_volume_name(config.task_id);

        backend.volume_create(&volume).await?;
        let result = self.run_with_volume(backend, &volume, cancel, config).await;
        if let Err(e) = backend.volume_delete(&volume).await {
            warn!("Failed to remove working volume {}: {}", volume, e);
        }

        result
    }

    fn working_directory(&self, _project_dir: &str, _dirty_mode: bool) -> String {
        match &self.custom_working_dir {
            Some(dir) if !dir.is_empty() => dir.clone(),
            _ => self.platform.generic_working_dir(),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl Container {
    async fn run_with_volume(
        &self,
        backend: &dyn ContainerBackend,
        volume: &str,
        cancel: &CancellationToken,
        config: &RunConfig,
    ) -> Result<()> {
        let working_dir = self.working_directory(&config.project_dir_str(), config.dirty_mode);

        populate_volume(
            backend,
            self.platform.as_ref(),
            volume,
            !config.dirty_mode,
            cancel,
            config,
        )
        .await?;

        backend.image_pull(&self.image).await?;

        let mut sidecars = Vec::new();
        let result = async {
            for additional in &self.additional_containers {
                let mut spec = sidecar_spec(additional, volume, sidecars.first());
                if sidecars.is_empty() {
                    // The first sidecar owns the shared network namespace, so it
                    // publishes the ports of every sidecar.
                    spec.ports = self
                        .additional_containers
                        .iter()
                        .flat_map(|c| c.ports.iter().copied())
                        .collect();
                }
                let id = backend.container_start(&spec).await?;
                info!("Started additional container {} ({})", additional.name, id);
                sidecars.push(id);
            }

            let mut mounts = vec![volume_mount(self.platform.as_ref(), volume)];
            if config.dirty_mode {
                mounts.push(Mount {
                    source: config.project_dir_str(),
                    target: working_dir.clone(),
                    read_only: false,
                });
            }

            let mut command = vec![self.platform.container_agent_path()];
            command.extend(config.agent_args("", ""));

            let spec = ContainerSpec {
                name: format!("{}-main", volume),
                image: self.image.clone(),
                command,
                env: config.environment.clone(),
                mounts,
                working_dir: Some(working_dir.clone()),
                cpu: self.cpu,
                memory: self.memory,
                platform: self.architecture.map(|arch| arch.docker_platform().to_string()),
                network_of: sidecars.first().cloned(),
                ports: Vec::new(),
            };

            let code = backend.container_run(&spec, cancel).await?;
            if code != 0 {
                return Err(StratusError::Container(format!(
                    "agent container exited with code {}",
                    code
                )));
            }
            Ok::<(), StratusError>(())
        }
        .await;

        for id in sidecars {
            if let Err(e) = backend.container_delete(&id).await {
                warn!("Failed to remove additional container {}: {}", id, e);
            }
        }

        result
    }
}

pub(crate) fn working_volume_name(task_id: i64) -> String {
    format!("stratus-working-volume-{}-{}", task_id, Uuid::new_v4().simple())
}

pub(crate) fn volume_mount(platform: &dyn Platform, volume: &str) -> Mount {
    Mount {
        source: volume.to_string(),
        target: platform.container_agent_volume_dir(),
        read_only: false,
    }
}

/// Copies the agent, and the project when `populate` is set, into the
/// working volume using a throwaway container of the agent image.
pub(crate) async fn populate_volume(
    backend: &dyn ContainerBackend,
    platform: &dyn Platform,
    volume: &str,
    populate: bool,
    cancel: &CancellationToken,
    config: &RunConfig,
) -> Result<()> {
    let agent_image = platform.container_agent_image(config.agent_version());
    backend.image_pull(&agent_image).await?;

    let copy = platform.container_copy_command(populate);
    let mut mounts = vec![Mount {
        source: volume.to_string(),
        target: copy.copies_agent_to_dir.clone(),
        read_only: false,
    }];
    if populate {
        mounts.push(Mount {
            source: config.project_dir_str(),
            target: copy.copies_project_from_dir.clone(),
            read_only: true,
        });
    }

    let spec = ContainerSpec {
        name: format!("{}-copy", volume),
        image: agent_image,
        command: copy.command,
        mounts,
        ..Default::default()
    };

    let code = backend.container_run(&spec, cancel).await?;
    if code != 0 {
        return Err(StratusError::Container(format!(
            "failed to populate working volume {}: copy exited with code {}",
            volume, code
        )));
    }
    Ok(())
}

fn sidecar_spec(
    additional: &AdditionalContainer,
    volume: &str,
    network_owner: Option<&String>,
) -> ContainerSpec {
    ContainerSpec {
        name: format!("{}-{}", volume, additional.name),
        image: additional.image.clone(),
        command: additional.command.clone(),
        env: additional.environment.clone(),
        cpu: additional.cpu,
        memory: additional.memory,
        network_of: network_owner.cloned(),
        ..Default::default()
    }
}
