//! Error types used by the supervisor and the shim.

use anyhow::Error as AnyError;
use oci_spec::OciSpecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An error occurred while parsing the OCI spec
    #[error("{0}")]
    Oci(#[from] OciSpecError),
    /// An error that can occur while reading or writing process state
    #[error("{0}")]
    Stdio(#[from] std::io::Error),
    #[error("{0}")]
    Others(String),
    /// Requested item is not found
    #[error("not found: {0}")]
    NotFound(String),
    /// Requested item already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Supplied arguments/options/config is invalid
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Any other error
    #[error("{0}")]
    Any(#[from] AnyError),
    /// The operation was rejected because the system is not in a state required for the operation's
    #[error("{0}")]
    FailedPrecondition(String),
    /// Error while parsing JSON
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Error from the system
    #[cfg(unix)]
    #[error("{0}")]
    Errno(#[from] nix::errno::Errno),
    /// The runtime binary failed a mutating command (create, start, delete, checkpoint, ...)
    #[error("runtime: {0}")]
    Runtime(String),
    /// The runtime binary failed a read-only query; the caller may retry
    #[error("runtime query: {0}")]
    RuntimeQuery(String),
    /// A pidfile exists but does not hold a pid
    #[error("invalid pid file: {0}")]
    PidFile(String),
    /// The shim died before reporting the container pid
    #[error("shim exited prematurely: {0}")]
    ShimExited(String),
    /// The process exited but its exit status was never recorded
    #[error("indeterminate exit status: {0}")]
    IndeterminateExit(String),
    /// The process to signal no longer exists
    #[error("process not found: {0}")]
    ProcessNotFound(String),
    /// The operation was canceled or timed out
    #[error("canceled: {0}")]
    Canceled(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RuntimeQuery(_))
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
