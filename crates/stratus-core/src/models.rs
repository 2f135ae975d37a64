use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Encoded instance as it arrives from the task protocol: a type name plus an
/// untyped payload. `kind` may be a full type URL, only its last path segment
/// is significant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskInstance {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn type_name(&self) -> &str {
        self.kind.rsplit('/').next().unwrap_or(&self.kind)
    }

    /// Decodes the payload for every kind we know about. Unknown kinds are not
    /// an error, they come back as `Descriptor::Unknown`.
    pub fn decode(&self) -> Result<Descriptor, serde_json::Error> {
        let descriptor = match self.type_name() {
            "ContainerInstance" => Descriptor::Container(self.payload_as()?),
            "PipeInstance" => Descriptor::Pipe(self.payload_as()?),
            "PrebuiltImageInstance" => Descriptor::PrebuiltImage(self.payload_as()?),
            "PersistentWorkerInstance" => Descriptor::PersistentWorker(self.payload_as()?),
            "DockerBuilder" => Descriptor::DockerBuilder(self.payload_as()?),
            "MacOSInstance" => Descriptor::MacOs(self.payload_as()?),
            other => Descriptor::Unknown(other.to_string()),
        };
        Ok(descriptor)
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let payload = if self.payload.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(payload)
    }
}

#[derive(Debug, Clone)]
pub enum Descriptor {
    Container(ContainerInstance),
    Pipe(PipeInstance),
    PrebuiltImage(PrebuiltImageInstance),
    PersistentWorker(PersistentWorkerInstance),
    DockerBuilder(DockerBuilder),
    MacOs(MacOsInstance),
    Unknown(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuestPlatform {
    #[default]
    Linux,
    Windows,
    Darwin,
    Freebsd,
    Netbsd,
    Openbsd,
    Solaris,
}

impl GuestPlatform {
    /// GOOS-style name, e.g. `darwin`.
    pub fn os_name(&self) -> &'static str {
        match self {
            GuestPlatform::Linux => "linux",
            GuestPlatform::Windows => "windows",
            GuestPlatform::Darwin => "darwin",
            GuestPlatform::Freebsd => "freebsd",
            GuestPlatform::Netbsd => "netbsd",
            GuestPlatform::Openbsd => "openbsd",
            GuestPlatform::Solaris => "solaris",
        }
    }
}

impl fmt::Display for GuestPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.os_name().to_uppercase())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Architecture {
    #[default]
    Amd64,
    Arm64,
}

impl Architecture {
    pub fn docker_platform(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "linux/amd64",
            Architecture::Arm64 => "linux/arm64",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerInstance {
    pub image: String,
    pub cpu: f32,
    /// Megabytes.
    pub memory: u32,
    pub additional_containers: Vec<AdditionalContainer>,
    pub platform: GuestPlatform,
    pub os_version: String,
    pub architecture: Architecture,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditionalContainer {
    pub name: String,
    pub image: String,
    pub cpu: f32,
    pub memory: u32,
    pub environment: HashMap<String, String>,
    pub command: Vec<String>,
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeInstance {
    pub cpu: f32,
    pub memory: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrebuiltImageInstance {
    pub repository: String,
    pub reference: String,
    pub dockerfile: String,
    pub arguments: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentWorkerInstance {
    pub isolation: Option<Isolation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerBuilder {
    pub platform: GuestPlatform,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MacOsInstance {
    pub image: String,
    pub user: String,
    pub password: String,
    pub cpu: u32,
    /// Megabytes.
    pub memory: u32,
}

/// How a persistent worker should isolate the task it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Isolation {
    None,
    Tart {
        image: String,
        user: String,
        password: String,
        #[serde(default)]
        cpu: u32,
        #[serde(default)]
        memory: u32,
    },
    Parallels {
        image: String,
        user: String,
        password: String,
        #[serde(default)]
        platform: GuestPlatform,
    },
    Container {
        image: String,
        #[serde(default)]
        cpu: f32,
        #[serde(default)]
        memory: u32,
    },
}

impl Isolation {
    pub fn kind(&self) -> IsolationKind {
        match self {
            Isolation::None => IsolationKind::None,
            Isolation::Tart { .. } => IsolationKind::Tart,
            Isolation::Parallels { .. } => IsolationKind::Parallels,
            Isolation::Container { .. } => IsolationKind::Container,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    None,
    Tart,
    Parallels,
    Container,
}

impl fmt::Display for IsolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationKind::None => "none",
            IsolationKind::Tart => "tart",
            IsolationKind::Parallels => "parallels",
            IsolationKind::Container => "container",
        };
        f.write_str(name)
    }
}

/// A task command. Only the name and properties matter to this layer; the
/// agent receives the rest through the task protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub name: String,
    pub properties: HashMap<String, String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
