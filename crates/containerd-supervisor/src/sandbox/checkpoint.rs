//! Named checkpoints stored under `<bundle>/checkpoints/<name>/`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::runtime::OciRuntime;
use crate::sandbox::utils::{validate_name, write_atomic};
use crate::sandbox::{Error, Result};

pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const CHECKPOINT_CONFIG: &str = "config.json";

/// A checkpoint descriptor, stored as `config.json` next to the image data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    /// Stop the container once the checkpoint is taken.
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub tcp: bool,
    #[serde(rename = "unixSockets", default)]
    pub unix_sockets: bool,
    /// Namespaces the restored container should get fresh instead of from the image.
    #[serde(rename = "emptyNS", default, skip_serializing_if = "Vec::is_empty")]
    pub empty_ns: Vec<String>,
}

impl Checkpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Utc::now(),
            exit: false,
            shell: false,
            tcp: false,
            unix_sockets: false,
            empty_ns: vec![],
        }
    }

    pub fn checkpoint_args(&self) -> Vec<String> {
        let mut args = vec![];
        if !self.exit {
            args.push("--leave-running".to_string());
        }
        args.extend(self.common_args());
        args
    }

    pub fn restore_args(&self) -> Vec<String> {
        let mut args = self.common_args();
        for ns in &self.empty_ns {
            args.push("--empty-ns".to_string());
            args.push(ns.clone());
        }
        args
    }

    fn common_args(&self) -> Vec<String> {
        [
            (self.shell, "--shell-job"),
            (self.tcp, "--tcp-established"),
            (self.unix_sockets, "--ext-unix-sk"),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, flag)| flag.to_string())
        .collect()
    }

    /// Reads the descriptor in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let contents = fs::read(dir.join(CHECKPOINT_CONFIG))?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

/// Counts checkpoint operations in flight for one container.
///
/// While non-zero, a process of that container that outlives its shim is not force-killed.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }

    pub fn enter(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

pub struct InFlightGuard(InFlight);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The checkpoints of one bundle.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(bundle: &Path) -> Self {
        Self {
            dir: bundle.join(CHECKPOINT_DIR),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Writes the descriptor and has the runtime dump container `id` into the checkpoint directory.
    pub async fn create(
        &self,
        runtime: &OciRuntime,
        id: &str,
        mut checkpoint: Checkpoint,
    ) -> Result<Checkpoint> {
        validate_name("checkpoint name", &checkpoint.name)?;
        fs::create_dir_all(&self.dir)?;

        let path = self.path(&checkpoint.name);
        match fs::create_dir(&path) {
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(format!(
                    "checkpoint {}",
                    checkpoint.name
                )));
            }
            res => res?,
        }

        checkpoint.created = Utc::now();
        let res = async {
            write_atomic(
                &path.join(CHECKPOINT_CONFIG),
                serde_json::to_vec(&checkpoint)?,
            )?;
            runtime.checkpoint(id, &path, &checkpoint).await
        }
        .await;

        if let Err(err) = res {
            if let Err(cleanup) = fs::remove_dir_all(&path) {
                log::warn!("failed to remove checkpoint {}: {cleanup}", path.display());
            }
            return Err(err);
        }

        log::info!("checkpointed container {id} as {}", checkpoint.name);
        Ok(checkpoint)
    }

    pub fn get(&self, name: &str) -> Result<Checkpoint> {
        validate_name("checkpoint name", name)?;
        match Checkpoint::load(&self.path(name)) {
            Err(Error::Stdio(err)) if err.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("checkpoint {name}")))
            }
            res => res,
        }
    }

    /// Every valid checkpoint, sorted by name. Entries without a readable descriptor are skipped.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };

        let mut checkpoints = vec![];
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match Checkpoint::load(&entry.path()) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    log::debug!("skipping checkpoint {}: {err}", entry.path().display());
                }
            }
        }
        checkpoints.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(checkpoints)
    }

    /// Removes checkpoint `name`. Removing a checkpoint that does not exist is a no-op.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name("checkpoint name", name)?;
        match fs::remove_dir_all(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Others(format!(
                "failed to remove checkpoint {name}: {err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use tempfile::tempdir;

    use super::*;
    use crate::sandbox::testing;

    #[test]
    fn test_flag_translation() {
        let mut checkpoint = Checkpoint::new("cp");
        assert_eq!(checkpoint.checkpoint_args(), ["--leave-running"]);
        assert!(checkpoint.restore_args().is_empty());

        checkpoint.exit = true;
        checkpoint.shell = true;
        checkpoint.tcp = true;
        checkpoint.unix_sockets = true;
        checkpoint.empty_ns = vec!["network".to_string()];
        assert_eq!(
            checkpoint.checkpoint_args(),
            ["--shell-job", "--tcp-established", "--ext-unix-sk"]
        );
        assert_eq!(
            checkpoint.restore_args(),
            [
                "--shell-job",
                "--tcp-established",
                "--ext-unix-sk",
                "--empty-ns",
                "network"
            ]
        );
    }

    #[test]
    fn test_descriptor_field_names() -> anyhow::Result<()> {
        let mut checkpoint = Checkpoint::new("cp");
        checkpoint.unix_sockets = true;
        let raw = serde_json::to_value(&checkpoint)?;
        assert_eq!(raw["unixSockets"], true);
        assert_eq!(raw["name"], "cp");
        assert!(raw.get("emptyNS").is_none());
        assert!(raw["created"].is_string());
        Ok(())
    }

    #[tokio::test]
    async fn test_create_list_delete() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let bundle = testing::create_bundle(&dir.path().join("bundle"), None)?;
        let runtime = testing::runtime(&dir.path().join("runtime"));
        let store = CheckpointStore::new(&bundle);

        assert!(store.list()?.is_empty());

        let opts = crate::sandbox::runtime::LaunchOpts {
            pid_file: dir.path().join("pid"),
            ..Default::default()
        };
        let io = crate::sandbox::runtime::Io::default();
        let pid = runtime.create("c1", &bundle, &opts, &io).await?;
        runtime.start("c1").await?;

        let mut checkpoint = Checkpoint::new("cp1");
        checkpoint.shell = true;
        let before = Utc::now();
        let created = store.create(&runtime, "c1", checkpoint).await?;
        assert!(created.created >= before);

        let listed = store.list()?;
        assert_eq!(listed, vec![created.clone()]);
        assert!(listed[0].shell);
        assert_eq!(store.get("cp1")?, created);

        let calls = testing::runtime_calls(&dir.path().join("runtime"))?;
        let call = calls.iter().find(|c| c.starts_with("checkpoint")).unwrap();
        assert!(call.contains("--leave-running --shell-job c1"), "{call}");

        let err = store.create(&runtime, "c1", Checkpoint::new("cp1")).await;
        assert!(matches!(err, Err(Error::AlreadyExists(_))));

        store.delete("cp1")?;
        store.delete("cp1")?;
        assert!(store.list()?.is_empty());
        assert!(matches!(store.get("cp1"), Err(Error::NotFound(_))));

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        )?;
        Ok(())
    }

    #[test]
    fn test_list_skips_invalid() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = CheckpointStore::new(dir.path());
        fs::create_dir_all(store.path("empty"))?;
        fs::create_dir_all(store.path("garbage"))?;
        fs::write(store.path("garbage").join(CHECKPOINT_CONFIG), "{not json")?;
        fs::create_dir_all(store.path("good"))?;
        fs::write(
            store.path("good").join(CHECKPOINT_CONFIG),
            serde_json::to_vec(&Checkpoint::new("good"))?,
        )?;
        fs::write(dir.path().join(CHECKPOINT_DIR).join("stray-file"), "")?;

        let names: Vec<_> = store.list()?.into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["good"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_checkpoint_leaves_nothing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let bundle = testing::create_bundle(&dir.path().join("bundle"), None)?;
        let runtime = OciRuntime::new("/nonexistent/runtime", None, vec![], testing::monitor());
        let store = CheckpointStore::new(&bundle);
        let err = store.create(&runtime, "c1", Checkpoint::new("cp")).await;
        assert!(matches!(err, Err(Error::Runtime(_))));
        assert!(store.list()?.is_empty());
        assert!(!store.path("cp").exists());
        Ok(())
    }

    #[test]
    fn test_delete_partial_failure() -> anyhow::Result<()> {
        if nix::unistd::geteuid().is_root() {
            // root ignores directory permissions
            return Ok(());
        }
        let dir = tempdir()?;
        let store = CheckpointStore::new(dir.path());
        let locked = store.path("cp").join("images");
        fs::create_dir_all(&locked)?;
        fs::write(locked.join("pages.img"), "")?;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500))?;

        let res = store.delete("cp");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700))?;
        assert!(matches!(res, Err(Error::Others(_))));
        assert!(store.path("cp").exists());
        Ok(())
    }

    #[test]
    fn test_in_flight() {
        let in_flight = InFlight::default();
        assert!(!in_flight.is_active());
        let a = in_flight.enter();
        let b = in_flight.clone().enter();
        assert!(in_flight.is_active());
        drop(a);
        assert!(in_flight.is_active());
        drop(b);
        assert!(!in_flight.is_active());
    }
}
