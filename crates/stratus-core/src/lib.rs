pub mod config;
pub mod error;
pub mod host;
pub mod logger;
pub mod models;
pub mod platform;

pub use config::StratusConfig;
pub use error::{IsolationStage, Result, StratusError};
pub use host::HostFacts;
pub use logger::{Lightweight, LightweightStub, SharedLogger, TracingLogger};
pub use models::*;
pub use platform::{CopyCommand, Platform, Unix, Windows};
