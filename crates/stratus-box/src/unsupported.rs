use async_trait::async_trait;
use stratus_core::{Result, StratusError};
use tokio_util::sync::CancellationToken;

use crate::runconfig::RunConfig;
use crate::traits::Instance;

/// Stand-in for an instance type this runner does not know how to execute.
/// Constructing it never fails; running it always does.
#[derive(Debug, Clone)]
pub struct Unsupported {
    reason: String,
}

impl Unsupported {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl Instance for Unsupported {
    fn kind(&self) -> &'static str {
        "unsupported"
    }

    async fn run(&self, _cancel: &CancellationToken, _config: &RunConfig) -> Result<()> {
        Err(StratusError::UnsupportedInstance(self.reason.clone()))
    }

    fn working_directory(&self, _project_dir: &str, _dirty_mode: bool) -> String {
        String::new()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
