//! `process.json`: everything a shim needs to launch its process without talking to the supervisor.

use std::fs;
use std::path::Path;

use oci_spec::runtime::{LinuxIdMapping, LinuxNamespaceType, Process, Spec};
use serde::{Deserialize, Serialize};

use crate::sandbox::Result;
use crate::sandbox::utils::write_atomic;

pub const PROCESS_STATE_FILE: &str = "process.json";

/// Stdio paths of a process. Empty paths mean `/dev/null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
}

impl Stdio {
    pub fn new(
        stdin: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        fn or_null(path: String) -> String {
            if path.is_empty() {
                "/dev/null".to_string()
            } else {
                path
            }
        }
        Self {
            stdin: or_null(stdin.into()),
            stdout: or_null(stdout.into()),
            stderr: or_null(stderr.into()),
        }
    }

    pub fn null() -> Self {
        Self::new("", "", "")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessState {
    #[serde(flatten)]
    pub process: Process,
    pub exec: bool,
    #[serde(rename = "containerdStdin")]
    pub stdin: String,
    #[serde(rename = "containerdStdout")]
    pub stdout: String,
    #[serde(rename = "containerdStderr")]
    pub stderr: String,
    #[serde(rename = "runtimeArgs", default)]
    pub runtime_args: Vec<String>,
    #[serde(rename = "noPivotRoot", default)]
    pub no_pivot_root: bool,
    /// Path of the checkpoint image to restore from, empty for a fresh start.
    #[serde(default)]
    pub checkpoint: String,
    #[serde(rename = "rootUID")]
    pub root_uid: u32,
    #[serde(rename = "rootGID")]
    pub root_gid: u32,
}

impl ProcessState {
    pub fn stdio(&self) -> Stdio {
        Stdio::new(&self.stdin, &self.stdout, &self.stderr)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let contents = fs::read(dir.join(PROCESS_STATE_FILE))?;
        Ok(serde_json::from_slice(&contents)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let contents = serde_json::to_vec(self)?;
        write_atomic(&dir.join(PROCESS_STATE_FILE), contents)?;
        Ok(())
    }
}

/// Host uid and gid that container root maps to, `(0, 0)` without a user namespace.
pub fn root_ids(spec: &Spec) -> (u32, u32) {
    let Some(linux) = spec.linux() else {
        return (0, 0);
    };
    let has_userns = linux
        .namespaces()
        .iter()
        .flatten()
        .any(|ns| ns.typ() == LinuxNamespaceType::User);
    if !has_userns {
        return (0, 0);
    }
    let uid = host_id(0, linux.uid_mappings().as_deref().unwrap_or_default());
    let gid = host_id(0, linux.gid_mappings().as_deref().unwrap_or_default());
    (uid, gid)
}

fn host_id(id: u32, mappings: &[LinuxIdMapping]) -> u32 {
    mappings
        .iter()
        .find(|m| id >= m.container_id() && id - m.container_id() < m.size())
        .map(|m| m.host_id() + (id - m.container_id()))
        .unwrap_or(id)
}
