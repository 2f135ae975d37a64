pub mod container;
pub mod dispatch;
pub mod persistentworker;
pub mod pipe;
pub mod prebuilt;
pub mod remoteagent;
pub mod retry;
pub mod runconfig;
pub mod traits;
pub mod unsupported;
pub mod vm;

pub use dispatch::{new_from_descriptor, InstanceFactory};
pub use persistentworker::{DefaultResolver, PersistentWorkerResolver, SecurityPolicy};
pub use runconfig::RunConfig;
pub use traits::{execute, Instance};
pub use unsupported::Unsupported;
pub use vm::{VmIsolation, VmSettings};
