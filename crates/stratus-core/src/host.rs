/// Operating system and CPU architecture of the machine we run on, in the
/// GOOS/GOARCH vocabulary the agent binaries are published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub os: String,
    pub arch: String,
}

impl HostFacts {
    pub fn current() -> Self {
        Self {
            os: agent_os(std::env::consts::OS).to_string(),
            arch: agent_arch(std::env::consts::ARCH).to_string(),
        }
    }

    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }
}

impl Default for HostFacts {
    fn default() -> Self {
        Self::current()
    }
}

fn agent_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn agent_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_names_are_translated() {
        assert_eq!(agent_os("macos"), "darwin");
        assert_eq!(agent_os("linux"), "linux");
        assert_eq!(agent_arch("x86_64"), "amd64");
        assert_eq!(agent_arch("aarch64"), "arm64");
    }

    #[test]
    fn test_current_is_stable() {
        assert_eq!(HostFacts::current(), HostFacts::current());
    }
}
