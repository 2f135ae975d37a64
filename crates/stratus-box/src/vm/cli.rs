use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::backend::VmError;

/// Runs a virtualization CLI to completion and returns its trimmed stdout.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<String, VmError> {
    debug!("{} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| VmError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(VmError::Command {
            command: format!("{} {}", program, args.first().copied().unwrap_or_default()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
