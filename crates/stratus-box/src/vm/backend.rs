use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    /// The VM has no lease yet. The only error worth retrying.
    #[error("DHCP snoop failed: {0}")]
    DhcpSnoopFailed(String),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected output from {program}: {message}")]
    Parse { program: String, message: String },

    #[error("VM {0} has no network interface")]
    NoInterface(String),

    #[error("VM {name} exited prematurely: {status}")]
    Exited { name: String, status: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VmError::DhcpSnoopFailed(_))
    }
}

/// Sizing applied to a fresh clone. Zero keeps the template's value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmResources {
    pub cpu: u32,
    /// Megabytes.
    pub memory: u32,
}

/// A virtualization tool able to clone VMs from templates.
#[async_trait]
pub trait VmBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn clone_vm(&self, template: &str, resources: &VmResources) -> Result<Box<dyn Vm>, VmError>;
}

/// One cloned VM. Owned by a single run.
#[async_trait]
pub trait Vm: Send + Sync {
    fn ident(&self) -> &str;

    /// Whether the template was saved suspended rather than powered off.
    fn cloned_from_suspended(&self) -> bool;

    async fn start(&self) -> Result<(), VmError>;

    /// Asks the backend for the VM's current address. Safe to call repeatedly.
    async fn retrieve_ip(&self) -> Result<IpAddr, VmError>;

    /// Stops and deletes the VM. Calling it again after it succeeded is a no-op.
    async fn close(&self) -> Result<(), VmError>;
}
