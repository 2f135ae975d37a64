use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::backend::{Vm, VmBackend, VmError, VmResources};
use super::cli;

/// macOS/Linux VMs through the `tart` CLI.
#[derive(Debug, Clone)]
pub struct Tart {
    binary: String,
}

impl Tart {
    pub fn new() -> Self {
        Self {
            binary: "tart".to_string(),
        }
    }
}

impl Default for Tart {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmBackend for Tart {
    fn name(&self) -> &'static str {
        "tart"
    }

    #[instrument(skip(self))]
    async fn clone_vm(&self, template: &str, resources: &VmResources) -> Result<Box<dyn Vm>, VmError> {
        let name = format!("stratus-{}", Uuid::new_v4());
        cli::run(&self.binary, &["clone", template, name.as_str()]).await?;

        let vm = TartVm {
            binary: self.binary.clone(),
            name,
            process: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        if let Err(e) = vm.apply_resources(resources).await {
            // The clone already exists, don't leave it behind.
            if let Err(close_err) = vm.close().await {
                warn!("Failed to delete VM {} after failed resize: {}", vm.name, close_err);
            }
            return Err(e);
        }

        info!("Cloned {} from {}", vm.name, template);
        Ok(Box::new(vm))
    }
}

pub struct TartVm {
    binary: String,
    name: String,
    process: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl TartVm {
    async fn apply_resources(&self, resources: &VmResources) -> Result<(), VmError> {
        let cpu = resources.cpu.to_string();
        let memory = resources.memory.to_string();

        let mut args = vec!["set", self.name.as_str()];
        if resources.cpu != 0 {
            args.extend(["--cpu", cpu.as_str()]);
        }
        if resources.memory != 0 {
            args.extend(["--memory", memory.as_str()]);
        }
        if args.len() == 2 {
            return Ok(());
        }

        cli::run(&self.binary, &args).await.map(|_| ())
    }
}

#[async_trait]
impl Vm for TartVm {
    fn ident(&self) -> &str {
        &self.name
    }

    fn cloned_from_suspended(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<(), VmError> {
        let child = Command::new(&self.binary)
            .args(["run", "--no-graphics", self.name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VmError::Spawn {
                program: self.binary.clone(),
                source,
            })?;

        *self.process.lock().await = Some(child);
        Ok(())
    }

    async fn retrieve_ip(&self) -> Result<IpAddr, VmError> {
        if let Some(child) = self.process.lock().await.as_mut() {
            if let Some(status) = child.try_wait()? {
                return Err(VmError::Exited {
                    name: self.name.clone(),
                    status: status.to_string(),
                });
            }
        }

        let output = match cli::run(&self.binary, &["ip", self.name.as_str()]).await {
            Ok(output) => output,
            Err(VmError::Command { stderr, .. }) if lease_pending(&stderr) => {
                return Err(VmError::DhcpSnoopFailed(stderr))
            }
            Err(e) => return Err(e),
        };

        if output.is_empty() {
            return Err(VmError::DhcpSnoopFailed(format!("no address for {} yet", self.name)));
        }

        output.parse().map_err(|_| VmError::Parse {
            program: self.binary.clone(),
            message: format!("{:?} is not an IP address", output),
        })
    }

    #[instrument(skip(self), fields(vm = %self.name))]
    async fn close(&self) -> Result<(), VmError> {
        // Only a finished delete counts, an interrupted close must be redone.
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = cli::run(&self.binary, &["stop", self.name.as_str()]).await {
            warn!("Failed to stop {}: {}", self.name, e);
        }
        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill `tart run` for {}: {}", self.name, e);
            }
        }

        cli::run(&self.binary, &["delete", self.name.as_str()]).await?;
        self.closed.store(true, Ordering::SeqCst);
        info!("Deleted {}", self.name);
        Ok(())
    }
}

/// `tart ip` reports this until the guest has picked up a DHCP lease.
/// Anything else it prints on failure is permanent.
fn lease_pending(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no ip address found") || stderr.contains("timed out")
}
