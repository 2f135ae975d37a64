//! Turns a task's instance descriptor into a runnable [`Instance`].

use std::sync::Arc;
use stratus_core::config::{DEFAULT_AGENT_IMAGE_BASE, DEFAULT_REGISTRY_DOMAIN};
use stratus_core::{
    Command, Descriptor, GuestPlatform, HostFacts, Isolation, Platform, Result, SharedLogger,
    StratusConfig, StratusError, TaskInstance, Unix, Windows,
};
use tracing::{debug, instrument};

use crate::container::Container;
use crate::persistentworker::{DefaultResolver, PersistentWorkerResolver, SecurityPolicy};
use crate::pipe::{pipe_stages_from_commands, Pipe};
use crate::prebuilt::{prebuilt_image_name, Prebuilt};
use crate::traits::Instance;
use crate::unsupported::Unsupported;
use crate::vm::backend::VmResources;
use crate::vm::tart::Tart;
use crate::vm::{VmIsolation, VmSettings};

/// Builds instances. Holds everything construction needs that does not come
/// from the descriptor itself.
pub struct InstanceFactory {
    resolver: Arc<dyn PersistentWorkerResolver>,
    host: HostFacts,
    registry_domain: String,
    agent_image_base: String,
    vm_settings: VmSettings,
}

impl InstanceFactory {
    pub fn new(resolver: Arc<dyn PersistentWorkerResolver>) -> Self {
        Self {
            resolver,
            host: HostFacts::current(),
            registry_domain: DEFAULT_REGISTRY_DOMAIN.to_string(),
            agent_image_base: DEFAULT_AGENT_IMAGE_BASE.to_string(),
            vm_settings: VmSettings::default(),
        }
    }

    pub fn from_config(config: &StratusConfig) -> Self {
        Self {
            resolver: Arc::new(DefaultResolver::from_config(config)),
            host: HostFacts::current(),
            registry_domain: config.registry.domain.clone(),
            agent_image_base: config.agent.image_base.clone(),
            vm_settings: VmSettings::from_config(config),
        }
    }

    pub fn with_host(mut self, host: HostFacts) -> Self {
        self.vm_settings.host = host.clone();
        self.host = host;
        self
    }

    pub fn with_registry_domain(mut self, domain: impl Into<String>) -> Self {
        self.registry_domain = domain.into();
        self
    }

    pub fn with_vm_settings(mut self, settings: VmSettings) -> Self {
        self.vm_settings = settings;
        self
    }

    /// Picks and assembles the instance for `descriptor`.
    ///
    /// An absent descriptor or one of a kind this runner does not know
    /// yields [`Unsupported`], which only fails once it is run. A known kind
    /// that cannot work here is an error right away.
    #[instrument(skip_all, fields(kind = descriptor.map(|d| d.kind.as_str()).unwrap_or("<none>")))]
    pub fn construct(
        &self,
        descriptor: Option<&TaskInstance>,
        commands: &[Command],
        custom_working_dir: Option<&str>,
        logger: SharedLogger,
    ) -> Result<Box<dyn Instance>> {
        let Some(descriptor) = descriptor else {
            return Ok(Box::new(Unsupported::new(
                "got nil instance which means it's probably not supported by this runner",
            )));
        };

        let decoded = descriptor.decode().map_err(|e| {
            StratusError::CreateInstance(format!(
                "failed to decode {}: {}",
                descriptor.type_name(),
                e
            ))
        })?;

        let custom_working_dir = custom_working_dir
            .filter(|dir| !dir.is_empty())
            .map(str::to_string);

        let instance: Box<dyn Instance> = match decoded {
            Descriptor::Container(container) => {
                let (platform, architecture) = match container.platform {
                    GuestPlatform::Linux => {
                        let unix: Arc<dyn Platform> =
                            Arc::new(Unix::with_image_base(&self.agent_image_base));
                        (unix, Some(container.architecture))
                    }
                    GuestPlatform::Windows => {
                        let windows: Arc<dyn Platform> = Arc::new(
                            Windows::new(&container.os_version)
                                .with_image_base(&self.agent_image_base),
                        );
                        (windows, None)
                    }
                    other => {
                        return Err(StratusError::CreateInstance(format!(
                            "unsupported container platform: {}",
                            other
                        )))
                    }
                };

                Box::new(Container {
                    image: container.image,
                    cpu: container.cpu,
                    memory: container.memory,
                    additional_containers: container.additional_containers,
                    platform,
                    architecture,
                    custom_working_dir,
                })
            }
            Descriptor::Pipe(pipe) => Box::new(Pipe {
                cpu: pipe.cpu,
                memory: pipe.memory,
                stages: pipe_stages_from_commands(commands)?,
                custom_working_dir,
            }),
            Descriptor::PrebuiltImage(prebuilt) => Box::new(Prebuilt {
                image: prebuilt_image_name(
                    &self.registry_domain,
                    &prebuilt.repository,
                    &prebuilt.reference,
                ),
                dockerfile: prebuilt.dockerfile,
                arguments: prebuilt.arguments,
            }),
            Descriptor::PersistentWorker(worker) => self.resolver.resolve(
                worker.isolation.as_ref(),
                &SecurityPolicy::no_security(),
                logger,
            )?,
            Descriptor::DockerBuilder(builder) => {
                let declared = builder.platform.os_name().to_lowercase();
                if (declared == "windows" || declared == "darwin") && declared != self.host.os {
                    return Err(StratusError::CreateInstance(format!(
                        "cannot run a {} Docker builder on a {} host",
                        declared, self.host.os
                    )));
                }

                self.resolver
                    .resolve(Some(&Isolation::None), &SecurityPolicy::no_security(), logger)?
            }
            Descriptor::MacOs(macos) => Box::new(
                VmIsolation::new(
                    Arc::new(Tart::new()),
                    macos.image,
                    macos.user,
                    macos.password,
                    GuestPlatform::Darwin,
                )
                .with_resources(VmResources {
                    cpu: macos.cpu,
                    memory: macos.memory,
                })
                .with_settings(&self.vm_settings)
                .with_logger(logger),
            ),
            Descriptor::Unknown(kind) => Box::new(Unsupported::new(format!(
                "instance type {} is not supported by this runner",
                kind
            ))),
        };

        debug!("Constructed {} instance", instance.kind());
        Ok(instance)
    }
}

impl Default for InstanceFactory {
    fn default() -> Self {
        Self::new(Arc::new(DefaultResolver::default()))
    }
}

/// Shorthand for [`InstanceFactory::construct`] with default settings.
pub fn new_from_descriptor(
    descriptor: Option<&TaskInstance>,
    commands: &[Command],
    custom_working_dir: Option<&str>,
    logger: SharedLogger,
) -> Result<Box<dyn Instance>> {
    InstanceFactory::default().construct(descriptor, commands, custom_working_dir, logger)
}
