//! Guest path conventions for container-backed and VM-backed instances.
//!
//! Everything here is pure string shaping: no I/O and no state beyond what
//! the constructors capture.

use std::fmt::Debug;

use crate::config::DEFAULT_AGENT_IMAGE_BASE;

/// Working directory relative to the platform's base dir.
const WORKING_DIR: &str = "working-dir";

/// Where the project is mounted read-only while the working volume is populated.
const PROJECT_HOST_DIR: &str = "project-host";

/// Describes the helper container that fills the working volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyCommand {
    pub command: Vec<String>,
    pub copies_agent_to_dir: String,
    pub copies_project_from_dir: String,
    pub copies_project_to_dir: String,
}

pub trait Platform: Debug + Send + Sync {
    fn container_agent_image(&self, version: &str) -> String;
    fn container_copy_command(&self, populate: bool) -> CopyCommand;
    fn container_agent_path(&self) -> String;
    fn container_agent_volume_dir(&self) -> String;

    fn base_dir(&self) -> String;
    fn generic_working_dir(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct Unix {
    image_base: String,
}

impl Unix {
    pub fn new() -> Self {
        Self::with_image_base(DEFAULT_AGENT_IMAGE_BASE)
    }

    pub fn with_image_base(image_base: impl Into<String>) -> Self {
        Self {
            image_base: image_base.into(),
        }
    }
}

impl Default for Unix {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for Unix {
    fn container_agent_image(&self, version: &str) -> String {
        format!("{}{}", self.image_base, version)
    }

    fn container_copy_command(&self, populate: bool) -> CopyCommand {
        let agent_dir = self.base_dir();
        let project_from = format!("/{}", PROJECT_HOST_DIR);
        let project_to = self.generic_working_dir();

        let mut script = format!("cp /stratus-agent {}", self.container_agent_path());
        if populate {
            script.push_str(&format!(
                " && mkdir -p {to} && cp -a {from}/. {to}/",
                from = project_from,
                to = project_to
            ));
        }

        CopyCommand {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script],
            copies_agent_to_dir: agent_dir,
            copies_project_from_dir: project_from,
            copies_project_to_dir: project_to,
        }
    }

    fn container_agent_path(&self) -> String {
        format!("{}/stratus-agent", self.base_dir())
    }

    fn container_agent_volume_dir(&self) -> String {
        self.base_dir()
    }

    fn base_dir(&self) -> String {
        "/tmp/stratus".to_string()
    }

    fn generic_working_dir(&self) -> String {
        format!("{}/{}", self.base_dir(), WORKING_DIR)
    }
}

#[derive(Debug, Clone)]
pub struct Windows {
    os_version: String,
    image_base: String,
}

impl Windows {
    pub fn new(os_version: impl Into<String>) -> Self {
        Self {
            os_version: os_version.into(),
            image_base: DEFAULT_AGENT_IMAGE_BASE.to_string(),
        }
    }

    pub fn with_image_base(mut self, image_base: impl Into<String>) -> Self {
        self.image_base = image_base.into();
        self
    }

    pub fn os_version(&self) -> &str {
        &self.os_version
    }
}

impl Platform for Windows {
    fn container_agent_image(&self, version: &str) -> String {
        format!(
            "{}{}-windowsservercore-{}",
            self.image_base, version, self.os_version
        )
    }

    fn container_copy_command(&self, populate: bool) -> CopyCommand {
        let agent_dir = self.base_dir();
        let project_from = format!("C:\\{}", PROJECT_HOST_DIR);
        let project_to = self.generic_working_dir();

        let mut script = format!("copy C:\\stratus-agent.exe {}", self.container_agent_path());
        if populate {
            script.push_str(&format!(
                " && xcopy {} {} /e /i /q /y /h",
                project_from, project_to
            ));
        }

        CopyCommand {
            command: vec!["cmd".to_string(), "/c".to_string(), script],
            copies_agent_to_dir: agent_dir,
            copies_project_from_dir: project_from,
            copies_project_to_dir: project_to,
        }
    }

    fn container_agent_path(&self) -> String {
        format!("{}\\stratus-agent.exe", self.base_dir())
    }

    fn container_agent_volume_dir(&self) -> String {
        self.base_dir()
    }

    fn base_dir(&self) -> String {
        "C:\\Windows\\Temp\\stratus".to_string()
    }

    fn generic_working_dir(&self) -> String {
        format!("{}\\{}", self.base_dir(), WORKING_DIR)
    }
}
