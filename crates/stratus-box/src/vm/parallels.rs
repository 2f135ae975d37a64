use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::backend::{Vm, VmBackend, VmError, VmResources};
use super::cli;

const PRLCTL: &str = "prlctl";
const DHCP_LEASES_PATH: &str = "/Library/Preferences/Parallels/parallels_dhcp_leases";

/// Parallels Desktop VMs through `prlctl`. Addresses come from the Parallels
/// DHCP server's lease file rather than from the guest.
#[derive(Debug, Clone)]
pub struct Parallels {
    leases_path: PathBuf,
}

impl Parallels {
    pub fn new() -> Self {
        Self::with_leases_path(DHCP_LEASES_PATH)
    }

    pub fn with_leases_path(path: impl Into<PathBuf>) -> Self {
        Self {
            leases_path: path.into(),
        }
    }
}

impl Default for Parallels {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Hardware", default)]
    hardware: HashMap<String, serde_json::Value>,
}

impl VmInfo {
    fn mac_address(&self) -> Option<String> {
        self.hardware
            .get("net0")
            .and_then(|net| net.get("mac"))
            .and_then(|mac| mac.as_str())
            .map(|mac| mac.to_lowercase())
    }
}

async fn vm_info(name: &str) -> Result<VmInfo, VmError> {
    let output = cli::run(PRLCTL, &["list", "--info", "--json", name]).await?;

    let mut infos: Vec<VmInfo> = serde_json::from_str(&output).map_err(|e| VmError::Parse {
        program: PRLCTL.to_string(),
        message: e.to_string(),
    })?;

    if infos.is_empty() {
        return Err(VmError::Parse {
            program: PRLCTL.to_string(),
            message: format!("no VM named {:?}", name),
        });
    }
    Ok(infos.swap_remove(0))
}

/// Finds the most recent lease for `mac` in a Parallels lease file.
///
/// Entries look like `10.211.55.3="1700000000,1800,001c42a1b2c3,01001c42a1b2c3"`.
pub(crate) fn find_lease(leases: &str, mac: &str) -> Option<IpAddr> {
    let mac = mac.to_lowercase();

    leases
        .lines()
        .filter_map(|line| {
            let (ip, value) = line.split_once('=')?;
            let mut fields = value.trim().trim_matches('"').split(',');
            let issued: u64 = fields.next()?.trim().parse().ok()?;
            let _duration = fields.next()?;
            let lease_mac = fields.next()?.trim().to_lowercase();
            if lease_mac != mac {
                return None;
            }
            let ip: IpAddr = ip.trim().parse().ok()?;
            Some((issued, ip))
        })
        .max_by_key(|(issued, _)| *issued)
        .map(|(_, ip)| ip)
}

#[async_trait]
impl VmBackend for Parallels {
    fn name(&self) -> &'static str {
        "parallels"
    }

    #[instrument(skip(self))]
    async fn clone_vm(&self, template: &str, _resources: &VmResources) -> Result<Box<dyn Vm>, VmError> {
        let suspended = vm_info(template).await?.state == "suspended";

        let name = format!("stratus-{}", Uuid::new_v4());
        cli::run(PRLCTL, &["clone", template, "--name", name.as_str()]).await?;
        info!("Cloned {} from {} (suspended: {})", name, template, suspended);

        Ok(Box::new(ParallelsVm {
            name,
            suspended,
            leases_path: self.leases_path.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct ParallelsVm {
    name: String,
    suspended: bool,
    leases_path: PathBuf,
    closed: AtomicBool,
}

#[async_trait]
impl Vm for ParallelsVm {
    fn ident(&self) -> &str {
        &self.name
    }

    fn cloned_from_suspended(&self) -> bool {
        self.suspended
    }

    async fn start(&self) -> Result<(), VmError> {
        cli::run(PRLCTL, &["start", self.name.as_str()]).await.map(|_| ())
    }

    async fn retrieve_ip(&self) -> Result<IpAddr, VmError> {
        let mac = vm_info(&self.name)
            .await?
            .mac_address()
            .ok_or_else(|| VmError::NoInterface(self.name.clone()))?;

        let leases = match tokio::fs::read_to_string(&self.leases_path).await {
            Ok(leases) => leases,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VmError::DhcpSnoopFailed(format!(
                    "{} does not exist yet",
                    self.leases_path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        find_lease(&leases, &mac).ok_or_else(|| {
            VmError::DhcpSnoopFailed(format!("no lease for {} ({}) yet", self.name, mac))
        })
    }

    #[instrument(skip(self), fields(vm = %self.name))]
    async fn close(&self) -> Result<(), VmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = cli::run(PRLCTL, &["stop", self.name.as_str(), "--kill"]).await {
            warn!("Failed to stop {}: {}", self.name, e);
        }
        cli::run(PRLCTL, &["delete", self.name.as_str()]).await?;
        self.closed.store(true, Ordering::SeqCst);
        info!("Deleted {}", self.name);
        Ok(())
    }
}
