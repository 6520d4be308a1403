use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::{Error, Result};

/// Supervisor configuration, usually read from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding per-container and per-process state.
    pub root: PathBuf,
    /// Name of the runtime in the [`RuntimeRegistry`](crate::sandbox::runtime::RuntimeRegistry).
    pub runtime: String,
    /// Executable to run instead of the one the runtime would pick.
    pub runtime_binary: Option<String>,
    /// State directory of the runtime binary, passed as `--root`.
    pub runtime_root: PathBuf,
    /// Extra global arguments for the runtime binary.
    pub runtime_args: Vec<String>,
    /// Shim executable spawned for every container process.
    pub shim: PathBuf,
    /// How long to wait for a shim to report the container pid.
    pub start_timeout_secs: u64,
    pub no_pivot_root: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/run/containerd-supervisor"),
            runtime: "runc".to_string(),
            runtime_binary: None,
            runtime_root: PathBuf::from("/run/runc"),
            runtime_args: vec![],
            shim: PathBuf::from("containerd-shim-oci-v1"),
            start_timeout_secs: 30,
            no_pivot_root: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|err| Error::InvalidArgument(format!("invalid configuration: {err}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}
