//! Container and process supervision on top of an OCI runtime binary.

pub mod checkpoint;
pub mod config;
pub mod container;
pub mod error;
pub mod process;
pub mod process_state;
pub mod runtime;
pub mod shim;
pub mod state;
pub mod supervisor;
pub mod sync;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use checkpoint::Checkpoint;
pub use config::Config;
pub use container::{Container, CreateOpts};
pub use error::{Error, Result};
pub use process::{Process, ProcessHandle};
pub use process_state::Stdio;
pub use runtime::{OciRuntime, RuntimeRegistry};
pub use state::{ContainerStatus, ProcessStatus};
pub use supervisor::Supervisor;
pub use tokio_util::sync::CancellationToken;
