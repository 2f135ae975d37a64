use async_trait::async_trait;
use stratus_core::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::runconfig::RunConfig;

#[async_trait]
pub trait Instance: Send + Sync {
    /// Short name of the variant, used in logs and by `stratus describe`.
    fn kind(&self) -> &'static str;

    /// Run the task's commands inside the backend. Blocks for the whole task.
    async fn run(&self, cancel: &CancellationToken, config: &RunConfig) -> Result<()>;

    /// Where the task's commands will execute. Must not touch the backend.
    fn working_directory(&self, project_dir: &str, dirty_mode: bool) -> String;

    /// Release backend resources. Safe to call without a prior `run`.
    async fn close(&self) -> Result<()>;
}

/// Runs the instance under a child of `cancel` that also fires once the
/// configured timeout elapses, then closes it.
///
/// A failing `close` is only reported when `run` itself succeeded.
pub async fn execute(
    instance: &dyn Instance,
    cancel: &CancellationToken,
    config: &RunConfig,
) -> Result<()> {
    let token = cancel.child_token();

    let timer = config.timeout.map(|timeout| {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            token.cancel();
        })
    });

    let result = instance.run(&token, config).await;

    if let Some(timer) = timer {
        timer.abort();
    }

    match instance.close().await {
        Ok(()) => result,
        Err(e) if result.is_err() => {
            warn!("Failed to close {} instance after failed run: {}", instance.kind(), e);
            result
        }
        Err(e) => Err(e),
    }
}
