use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Step of the VM lifecycle at which an isolation failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationStage {
    Clone,
    Start,
    AddressDiscovery,
    AgentHandshake,
}

impl fmt::Display for IsolationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            IsolationStage::Clone => "clone",
            IsolationStage::Start => "start",
            IsolationStage::AddressDiscovery => "address discovery",
            IsolationStage::AgentHandshake => "agent handshake",
        };
        f.write_str(stage)
    }
}

#[derive(Error, Debug)]
pub enum StratusError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported instance type: {0}")]
    UnsupportedInstance(String),

    #[error("failed to create instance: {0}")]
    CreateInstance(String),

    #[error("{backend} isolation failed: {stage} of VM {vm:?}: {source}")]
    Isolation {
        backend: &'static str,
        vm: String,
        stage: IsolationStage,
        #[source]
        source: BoxError,
    },

    #[error("Container backend error: {0}")]
    Container(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl StratusError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, StratusError::UnsupportedInstance(_))
    }

    pub fn is_construction_failure(&self) -> bool {
        matches!(self, StratusError::CreateInstance(_))
    }

    pub fn is_isolation_failure(&self) -> bool {
        matches!(self, StratusError::Isolation { .. })
    }

    /// Stage of an isolation failure, if this is one.
    pub fn isolation_stage(&self) -> Option<IsolationStage> {
        match self {
            StratusError::Isolation { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StratusError>;
