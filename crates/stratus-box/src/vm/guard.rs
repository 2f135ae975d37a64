use std::sync::Arc;
use tracing::{error, warn};

use super::backend::{Vm, VmError};

/// Owns a cloned VM for the duration of a run and makes sure it is closed
/// exactly once.
///
/// `release` is the normal path. If the guard is dropped without it, for
/// example because the run future was aborted, the close is spawned onto the
/// current runtime instead.
pub struct VmGuard {
    vm: Arc<dyn Vm>,
    released: bool,
}

impl VmGuard {
    pub fn new(vm: Box<dyn Vm>) -> Self {
        Self {
            vm: Arc::from(vm),
            released: false,
        }
    }

    pub fn vm(&self) -> &dyn Vm {
        self.vm.as_ref()
    }

    /// Closes the VM. If this future is dropped before the close finishes,
    /// the guard's `Drop` takes over and closes in the background.
    pub async fn release(mut self) -> Result<(), VmError> {
        let result = self.vm.close().await;
        self.released = true;
        result
    }
}

impl Drop for VmGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let vm = self.vm.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("VM {} dropped without release, closing in background", vm.ident());
                handle.spawn(async move {
                    if let Err(e) = vm.close().await {
                        error!("Failed to close VM {}: {}", vm.ident(), e);
                    }
                });
            }
            Err(_) => error!("VM {} leaked: no runtime to close it on", vm.ident()),
        }
    }
}
