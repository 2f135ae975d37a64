use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Minimal logging sink handed to instance constructors.
pub trait Lightweight: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct LightweightStub;

impl Lightweight for LightweightStub {
    fn debug(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Forwards to `tracing`, tagging every event with the task it belongs to.
#[derive(Debug, Default, Clone)]
pub struct TracingLogger {
    task: Option<String>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_task(task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
        }
    }

    fn task(&self) -> &str {
        self.task.as_deref().unwrap_or("-")
    }
}

impl Lightweight for TracingLogger {
    fn debug(&self, message: &str) {
        debug!(task = self.task(), "{}", message);
    }

    fn info(&self, message: &str) {
        info!(task = self.task(), "{}", message);
    }

    fn warn(&self, message: &str) {
        warn!(task = self.task(), "{}", message);
    }

    fn error(&self, message: &str) {
        error!(task = self.task(), "{}", message);
    }
}

pub type SharedLogger = Arc<dyn Lightweight>;

pub fn stub() -> SharedLogger {
    Arc::new(LightweightStub)
}
