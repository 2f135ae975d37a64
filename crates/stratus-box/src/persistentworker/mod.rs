//! Instances for tasks that target a long-lived worker machine.

pub mod host;
pub mod security;

use std::sync::Arc;
use stratus_core::{GuestPlatform, Isolation, Result, SharedLogger, StratusConfig, Unix};

use crate::container::Container;
use crate::traits::Instance;
use crate::vm::backend::VmResources;
use crate::vm::parallels::Parallels;
use crate::vm::tart::Tart;
use crate::vm::{VmIsolation, VmSettings};
use host::HostAgent;
pub use security::SecurityPolicy;

/// Turns a worker isolation setting into something runnable.
pub trait PersistentWorkerResolver: Send + Sync {
    fn resolve(
        &self,
        isolation: Option<&Isolation>,
        security: &SecurityPolicy,
        logger: SharedLogger,
    ) -> Result<Box<dyn Instance>>;
}

#[derive(Clone, Default)]
pub struct DefaultResolver {
    vm_settings: VmSettings,
}

impl DefaultResolver {
    pub fn new(vm_settings: VmSettings) -> Self {
        Self { vm_settings }
    }

    pub fn from_config(config: &StratusConfig) -> Self {
        Self::new(VmSettings::from_config(config))
    }
}

impl PersistentWorkerResolver for DefaultResolver {
    fn resolve(
        &self,
        isolation: Option<&Isolation>,
        security: &SecurityPolicy,
        logger: SharedLogger,
    ) -> Result<Box<dyn Instance>> {
        let isolation = isolation.unwrap_or(&Isolation::None);
        security.check(isolation.kind())?;

        let instance: Box<dyn Instance> = match isolation {
            Isolation::None => Box::new(HostAgent::new(logger)),
            Isolation::Tart {
                image,
                user,
                password,
                cpu,
                memory,
            } => Box::new(
                VmIsolation::new(
                    Arc::new(Tart::new()),
                    image.as_str(),
                    user.as_str(),
                    password.as_str(),
                    GuestPlatform::Darwin,
                )
                .with_resources(VmResources {
                    cpu: *cpu,
                    memory: *memory,
                })
                .with_settings(&self.vm_settings)
                .with_logger(logger),
            ),
            Isolation::Parallels {
                image,
                user,
                password,
                platform,
            } => Box::new(
                VmIsolation::new(
                    Arc::new(Parallels::new()),
                    image.as_str(),
                    user.as_str(),
                    password.as_str(),
                    *platform,
                )
                .with_settings(&self.vm_settings)
                .with_logger(logger),
            ),
            Isolation::Container { image, cpu, memory } => Box::new(Container {
                image: image.clone(),
                cpu: *cpu,
                memory: *memory,
                additional_containers: Vec::new(),
                platform: Arc::new(Unix::new()),
                architecture: None,
                custom_working_dir: None,
            }),
        };

        Ok(instance)
    }
}
