use async_trait::async_trait;
use std::collections::HashMap;
use stratus_core::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::container::backend::ImageBuild;
use crate::runconfig::RunConfig;
use crate::traits::Instance;

/// Joins registry domain, repository and reference into `domain/repo:ref`.
/// Empty path segments are skipped.
pub fn prebuilt_image_name(domain: &str, repository: &str, reference: &str) -> String {
    let path = [domain.trim_end_matches('/'), repository.trim_matches('/')]
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}:{}", path, reference)
}

/// Builds an image that later tasks of the same build run in.
#[derive(Debug)]
pub struct Prebuilt {
    pub image: String,
    pub dockerfile: String,
    pub arguments: HashMap<String, String>,
}

#[async_trait]
impl Instance for Prebuilt {
    fn kind(&self) -> &'static str {
        "prebuilt"
    }

    #[instrument(skip(self, _cancel, config), fields(image = %self.image))]
    async fn run(&self, _cancel: &CancellationToken, config: &RunConfig) -> Result<()> {
        let build = ImageBuild {
            tag: self.image.clone(),
            dockerfile: (!self.dockerfile.is_empty()).then(|| self.dockerfile.clone()),
            context_dir: config.project_dir.clone(),
            arguments: self.arguments.clone(),
        };

        config.container_backend.image_build(&build).await?;
        info!("Built {}", self.image);
        Ok(())
    }

    /// The build context is the project itself.
    fn working_directory(&self, project_dir: &str, _dirty_mode: bool) -> String {
        project_dir.to_string()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
