use serde::Deserialize;

/// Default version of the in-guest agent.
pub const DEFAULT_AGENT_VERSION: &str = "1.106.0";

/// Prefix of the agent container image; the agent version is appended to it.
pub const DEFAULT_AGENT_IMAGE_BASE: &str = "ghcr.io/cirruslabs/cirrus-ci-agent:v";

/// Where VM guests download the agent binary from.
pub const DEFAULT_AGENT_DOWNLOAD_BASE: &str =
    "https://github.com/cirruslabs/cirrus-ci-agent/releases/download";

/// Registry domain prebuilt images are pushed to.
pub const DEFAULT_REGISTRY_DOMAIN: &str = "gcr.io";

#[derive(Debug, Clone, Deserialize)]
pub struct StratusConfig {
    pub agent: AgentConfig,
    pub registry: RegistryConfig,
    pub vm: VmConfig,
    pub ssh: SshConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub version: String,
    pub image_base: String,
    pub download_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    pub ip_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub port: u16,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl StratusConfig {
    pub fn new() -> Result<Self, config::ConfigError> {
        Self::builder()?
            // Merge stratus.toml if exists
            .add_source(config::File::with_name("stratus").required(false))
            // Merge environment variables (STRATUS_AGENT__VERSION, STRATUS_SSH__PORT, ...)
            .add_source(
                config::Environment::with_prefix("STRATUS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError>
    {
        config::Config::builder()
            .set_default("agent.version", DEFAULT_AGENT_VERSION)?
            .set_default("agent.image_base", DEFAULT_AGENT_IMAGE_BASE)?
            .set_default("agent.download_base", DEFAULT_AGENT_DOWNLOAD_BASE)?
            .set_default("registry.domain", DEFAULT_REGISTRY_DOMAIN)?
            .set_default("vm.ip_poll_interval_ms", 1000)?
            .set_default("ssh.port", 22)?
            .set_default("ssh.connect_timeout_secs", 60)?
            .set_default("log.level", "info")
    }
}

impl Default for StratusConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig {
                version: DEFAULT_AGENT_VERSION.to_string(),
                image_base: DEFAULT_AGENT_IMAGE_BASE.to_string(),
                download_base: DEFAULT_AGENT_DOWNLOAD_BASE.to_string(),
            },
            registry: RegistryConfig {
                domain: DEFAULT_REGISTRY_DOMAIN.to_string(),
            },
            vm: VmConfig {
                ip_poll_interval_ms: 1000,
            },
            ssh: SshConfig {
                port: 22,
                connect_timeout_secs: 60,
            },
            log: LogConfig {
                level: "info".to_string(),
            },
        }
    }
}
