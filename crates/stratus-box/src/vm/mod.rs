pub mod backend;
pub(crate) mod cli;
pub mod guard;
pub mod parallels;
pub mod tart;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use stratus_core::platform::{Platform, Unix, Windows};
use stratus_core::{
    GuestPlatform, HostFacts, IsolationStage, Result, SharedLogger, StratusConfig, StratusError,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::remoteagent::{AgentHandshake, HandshakeRequest, SshHandshake};
use crate::retry::poll_until;
use crate::runconfig::RunConfig;
use crate::traits::Instance;
use backend::{Vm, VmBackend, VmError, VmResources};
use guard::VmGuard;

/// Knobs shared by every VM-isolated instance a factory builds.
#[derive(Clone)]
pub struct VmSettings {
    pub poll_interval: Duration,
    pub handshake: Arc<dyn AgentHandshake>,
    pub host: HostFacts,
}

impl VmSettings {
    pub fn from_config(config: &StratusConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.vm.ip_poll_interval_ms),
            handshake: Arc::new(SshHandshake::from_config(config)),
            host: HostFacts::current(),
        }
    }
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            handshake: Arc::new(SshHandshake::new()),
            host: HostFacts::current(),
        }
    }
}

/// Runs the agent inside a throwaway clone of a VM template.
///
/// Every run clones, boots, waits for an address, hands off to the agent and
/// deletes the clone again, whatever happened in between.
pub struct VmIsolation {
    backend: Arc<dyn VmBackend>,
    image: String,
    user: String,
    password: String,
    agent_os: GuestPlatform,
    resources: VmResources,
    logger: SharedLogger,
    handshake: Arc<dyn AgentHandshake>,
    host: HostFacts,
    poll_interval: Duration,
}

impl VmIsolation {
    pub fn new(
        backend: Arc<dyn VmBackend>,
        image: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        agent_os: GuestPlatform,
    ) -> Self {
        let settings = VmSettings::default();
        Self {
            backend,
            image: image.into(),
            user: user.into(),
            password: password.into(),
            agent_os,
            resources: VmResources::default(),
            logger: stratus_core::logger::stub(),
            handshake: settings.handshake,
            host: settings.host,
            poll_interval: settings.poll_interval,
        }
    }

    /// A macOS guest under Tart.
    pub fn tart(
        image: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        cpu: u32,
        memory: u32,
    ) -> Self {
        Self::new(Arc::new(tart::Tart::new()), image, user, password, GuestPlatform::Darwin)
            .with_resources(VmResources { cpu, memory })
    }

    pub fn parallels(
        image: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        agent_os: GuestPlatform,
    ) -> Self {
        Self::new(Arc::new(parallels::Parallels::new()), image, user, password, agent_os)
    }

    pub fn with_resources(mut self, resources: VmResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn AgentHandshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_host(mut self, host: HostFacts) -> Self {
        self.host = host;
        self
    }

    pub fn with_settings(self, settings: &VmSettings) -> Self {
        self.with_handshake(settings.handshake.clone())
            .with_poll_interval(settings.poll_interval)
            .with_host(settings.host.clone())
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn stage_error(
        &self,
        vm: &str,
        stage: IsolationStage,
        source: impl Into<stratus_core::error::BoxError>,
    ) -> StratusError {
        StratusError::Isolation {
            backend: self.backend.name(),
            vm: vm.to_string(),
            stage,
            source: source.into(),
        }
    }

    fn guest_platform(&self) -> Box<dyn Platform> {
        match self.agent_os {
            GuestPlatform::Windows => Box::new(Windows::new("")),
            _ => Box::new(Unix::new()),
        }
    }

    async fn drive(&self, vm: &dyn Vm, cancel: &CancellationToken, config: &RunConfig) -> Result<()> {
        let ident = vm.ident();

        vm.start()
            .await
            .map_err(|e| self.stage_error(ident, IsolationStage::Start, e))?;
        self.logger.info(&format!("Started VM {}, waiting for an IP address", ident));

        let address = poll_until(cancel, self.poll_interval, || vm.retrieve_ip(), VmError::is_transient)
            .await
            .map_err(|e| self.stage_error(ident, IsolationStage::AddressDiscovery, e))?;
        info!("VM {} is reachable at {}", ident, address);
        self.logger.info(&format!("VM {} got IP address {}", ident, address));

        let working_dir = self.working_directory(&config.project_dir_str(), config.dirty_mode);
        let request = HandshakeRequest {
            address,
            user: &self.user,
            password: &self.password,
            os: self.agent_os.os_name(),
            arch: &self.host.arch,
            working_dir: &working_dir,
            config,
            cloned_from_suspended: vm.cloned_from_suspended(),
            extra_env: None,
        };

        self.handshake
            .wait_for_agent(cancel, request)
            .await
            .map_err(|e| self.stage_error(ident, IsolationStage::AgentHandshake, e))
    }
}

#[async_trait]
impl Instance for VmIsolation {
    fn kind(&self) -> &'static str {
        self.backend.name()
    }

    #[instrument(skip(self, cancel, config), fields(backend = self.backend.name(), image = %self.image))]
    async fn run(&self, cancel: &CancellationToken, config: &RunConfig) -> Result<()> {
        self.logger.info(&format!("Cloning VM from {}", self.image));

        let vm = self
            .backend
            .clone_vm(&self.image, &self.resources)
            .await
            .map_err(|e| self.stage_error(&self.image, IsolationStage::Clone, e))?;

        let guard = VmGuard::new(vm);
        let result = self.drive(guard.vm(), cancel, config).await;

        let ident = guard.vm().ident().to_string();
        match guard.release().await {
            Ok(()) => self.logger.info(&format!("Deleted VM {}", ident)),
            Err(e) => {
                warn!("Failed to delete VM {}: {}", ident, e);
                self.logger.warn(&format!("Failed to delete VM {}: {}", ident, e));
            }
        }

        if let Err(e) = &result {
            self.logger.error(&e.to_string());
        }
        result
    }

    fn working_directory(&self, _project_dir: &str, _dirty_mode: bool) -> String {
        self.guest_platform().generic_working_dir()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
