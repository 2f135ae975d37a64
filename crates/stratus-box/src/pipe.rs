use async_trait::async_trait;
use stratus_core::{Command, Platform, Result, StratusError, Unix};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::container::backend::ContainerSpec;
use crate::container::{populate_volume, volume_mount, working_volume_name};
use crate::runconfig::RunConfig;
use crate::traits::Instance;

/// Property of the command that starts a new stage.
const IMAGE_PROPERTY: &str = "image";

/// A run of consecutive commands executed in one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeStage {
    pub image: String,
    pub command_from: String,
    /// First command of the next stage, empty for the last one.
    pub command_to: String,
}

/// Splits the flat command list into stages. Every command carrying an
/// `image` property opens a new stage, so the first command must carry one.
pub fn pipe_stages_from_commands(commands: &[Command]) -> Result<Vec<PipeStage>> {
    let mut stages: Vec<PipeStage> = Vec::new();

    for command in commands {
        match command.properties.get(IMAGE_PROPERTY) {
            Some(image) => {
                if let Some(previous) = stages.last_mut() {
                    previous.command_to = command.name.clone();
                }
                stages.push(PipeStage {
                    image: image.clone(),
                    command_from: command.name.clone(),
                    command_to: String::new(),
                });
            }
            None if stages.is_empty() => {
                return Err(StratusError::CreateInstance(format!(
                    "pipe command {:?} comes before any command that sets an image",
                    command.name
                )));
            }
            None => {}
        }
    }

    Ok(stages)
}

/// Runs each stage in its own container, sequentially, on a shared working volume.
#[derive(Debug)]
pub struct Pipe {
    pub cpu: f32,
    pub memory: u32,
    pub stages: Vec<PipeStage>,
    pub custom_working_dir: Option<String>,
}

#[async_trait]
impl Instance for Pipe {
    fn kind(&self) -> &'static str {
        "pipe"
    }

    #[instrument(skip(self, cancel, config), fields(stages = self.stages.len(), task = config.task_id))]
    async fn run(&self, cancel: &CancellationToken, config: &RunConfig) -> Result<()> {
        let backend = config.container_backend.as_ref();
        let platform = Unix::new();
        let volume = working_volume_name(config.task_id);

        backend.volume_create(&volume).await?;

        let result = async {
            populate_volume(backend, &platform, &volume, !config.dirty_mode, cancel, config)
                .await?;

            let working_dir = self.working_directory(&config.project_dir_str(), config.dirty_mode);
            for (index, stage) in self.stages.iter().enumerate() {
                info!("Running stage {} in {}", index, stage.image);
                backend.image_pull(&stage.image).await?;

                let mut command = vec![platform.container_agent_path()];
                command.extend(config.agent_args(&stage.command_from, &stage.command_to));

                let spec = ContainerSpec {
                    name: format!("{}-stage-{}", volume, index),
                    image: stage.image.clone(),
                    command,
                    env: config.environment.clone(),
                    mounts: vec![volume_mount(&platform, &volume)],
                    working_dir: Some(working_dir.clone()),
                    cpu: self.cpu,
                    memory: self.memory,
                    ..Default::default()
                };

                let code = backend.container_run(&spec, cancel).await?;
                if code != 0 {
                    return Err(StratusError::Container(format!(
                        "pipe stage {} ({}) exited with code {}",
                        index, stage.image, code
                    )));
                }
            }
            Ok::<(), StratusError>(())
        }
        .await;

        if let Err(e) = backend.volume_delete(&volume).await {
            warn!("Failed to remove working volume {}: {}", volume, e);
        }

        result
    }

    fn working_directory(&self, _project_dir: &str, _dirty_mode: bool) -> String {
        match &self.custom_working_dir {
            Some(dir) if !dir.is_empty() => dir.clone(),
            _ => Unix::new().generic_working_dir(),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
