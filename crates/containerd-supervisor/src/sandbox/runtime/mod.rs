//! Driver for an external OCI runtime binary (`runc` or anything with the same CLI).

use std::ffi::OsString;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Utc;
use serde::Deserialize;

use crate::sandbox::checkpoint::Checkpoint;
use crate::sandbox::utils::{read_log_errors, read_pid_file};
use crate::sandbox::{Error, Result};
use crate::sys::reaper::{ExitEvent, Monitor};

pub mod registry;

pub use registry::{RuntimeConstructor, RuntimeOpts, RuntimeRegistry};

/// Output of the runtime's `state` subcommand.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RuntimeState {
    #[serde(default)]
    pub id: String,
    pub pid: i32,
    pub status: String,
    pub bundle: PathBuf,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub annotations: Option<std::collections::HashMap<String, String>>,
}

/// Stdio handed to the runtime for the container process. `None` is `/dev/null`.
#[derive(Debug, Default)]
pub struct Io {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

impl Io {
    fn apply(&self, cmd: &mut Command) -> std::io::Result<()> {
        fn stdio(file: &Option<File>) -> std::io::Result<Stdio> {
            Ok(match file {
                Some(file) => Stdio::from(file.try_clone()?),
                None => Stdio::null(),
            })
        }
        cmd.stdin(stdio(&self.stdin)?)
            .stdout(stdio(&self.stdout)?)
            .stderr(stdio(&self.stderr)?);
        Ok(())
    }
}

/// Options shared by the subcommands that start a container process.
#[derive(Debug, Clone, Default)]
pub struct LaunchOpts {
    pub pid_file: PathBuf,
    /// Runtime log, passed as `--log <file> --log-format json`.
    pub log: Option<PathBuf>,
    pub no_pivot_root: bool,
}

#[derive(Clone)]
pub struct OciRuntime {
    binary: String,
    root: Option<PathBuf>,
    args: Vec<String>,
    monitor: Monitor,
}

impl std::fmt::Debug for OciRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciRuntime")
            .field("binary", &self.binary)
            .field("root", &self.root)
            .field("args", &self.args)
            .finish()
    }
}

impl OciRuntime {
    pub fn new(
        binary: impl Into<String>,
        root: Option<PathBuf>,
        args: Vec<String>,
        monitor: Monitor,
    ) -> Self {
        Self {
            binary: binary.into(),
            root,
            args,
            monitor,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Global flags passed before every subcommand.
    pub fn global_args(&self) -> Vec<String> {
        let mut args = vec![];
        if let Some(root) = &self.root {
            args.push("--root".to_string());
            args.push(root.to_string_lossy().into_owned());
        }
        args.extend(self.args.iter().cloned());
        args
    }

    fn command(&self, log: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(log) = log {
            cmd.arg("--log").arg(log).args(["--log-format", "json"]);
        }
        cmd.args(self.global_args());
        cmd
    }

    fn spawn_error(&self, subcommand: &str, err: std::io::Error) -> Error {
        if err.kind() == ErrorKind::NotFound {
            Error::Runtime(format!("{} is not installed on the system", self.binary))
        } else {
            Error::Runtime(format!("{} {subcommand}: {err}", self.binary))
        }
    }

    /// Runs a subcommand that changes runtime state and returns its output.
    async fn exec_mut(&self, args: Vec<OsString>) -> Result<Vec<u8>> {
        let subcommand = subcommand_name(&args);
        let mut cmd = self.command(None);
        cmd.args(&args);
        let (event, output) = self
            .monitor
            .output(cmd)
            .await
            .map_err(|err| self.spawn_error(&subcommand, err))?;
        if !event.success() {
            return Err(Error::Runtime(self.failure(&subcommand, &event, &output)));
        }
        Ok(output)
    }

    /// Runs a read-only subcommand; failures are retryable.
    async fn query(&self, args: Vec<OsString>) -> Result<Vec<u8>> {
        let subcommand = subcommand_name(&args);
        let mut cmd = self.command(None);
        cmd.args(&args);
        let (event, output) = self
            .monitor
            .output(cmd)
            .await
            .map_err(|err| self.spawn_error(&subcommand, err))?;
        if !event.success() {
            return Err(Error::RuntimeQuery(self.failure(&subcommand, &event, &output)));
        }
        Ok(output)
    }

    /// Starts a container process and returns its pid, read from the pidfile.
    async fn launch(
        &self,
        args: Vec<OsString>,
        cwd: Option<&Path>,
        opts: &LaunchOpts,
        io: &Io,
    ) -> Result<i32> {
        let subcommand = subcommand_name(&args);
        let mut cmd = self.command(opts.log.as_deref());
        cmd.args(&args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        io.apply(&mut cmd)?;

        log::debug!("{} {subcommand} {args:?}", self.binary);
        let event = self
            .monitor
            .status(cmd)
            .await
            .map_err(|err| self.spawn_error(&subcommand, err))?;
        if !event.success() {
            let logged = opts
                .log
                .as_deref()
                .map(read_log_errors)
                .unwrap_or_default()
                .join("; ");
            return Err(Error::Runtime(self.failure(
                &subcommand,
                &event,
                logged.as_bytes(),
            )));
        }

        read_pid_file(&opts.pid_file)
    }

    fn failure(&self, subcommand: &str, event: &ExitEvent, output: &[u8]) -> String {
        let output = String::from_utf8_lossy(output);
        let output = output.trim();
        if output.is_empty() {
            format!("{} {subcommand} failed: {event}", self.binary)
        } else {
            format!("{} {subcommand} failed: {event}: {output}", self.binary)
        }
    }

    /// `create --bundle <bundle> --pid-file <f> <id>`, run from the bundle directory.
    pub async fn create(&self, id: &str, bundle: &Path, opts: &LaunchOpts, io: &Io) -> Result<i32> {
        let mut args = os_args(["create", "--bundle"]);
        args.push(bundle.into());
        args.push("--pid-file".into());
        args.push(opts.pid_file.clone().into());
        if opts.no_pivot_root {
            args.push("--no-pivot".into());
        }
        args.push(id.into());
        self.launch(args, Some(bundle), opts, io).await
    }

    /// `exec --detach --process <spec> --pid-file <f> <id>`, run from the bundle directory.
    pub async fn exec(
        &self,
        id: &str,
        bundle: &Path,
        process_spec: &Path,
        opts: &LaunchOpts,
        io: &Io,
    ) -> Result<i32> {
        let mut args = os_args(["exec", "--detach", "--process"]);
        args.push(process_spec.into());
        args.push("--pid-file".into());
        args.push(opts.pid_file.clone().into());
        args.push(id.into());
        self.launch(args, Some(bundle), opts, io).await
    }

    /// `restore --detach --image-path <dir> ... <id>`: starts the container from a checkpoint.
    pub async fn restore(
        &self,
        id: &str,
        bundle: &Path,
        image_path: &Path,
        checkpoint: &Checkpoint,
        opts: &LaunchOpts,
        io: &Io,
    ) -> Result<i32> {
        let work_path = image_path
            .join("criu.work")
            .join(format!("restore-{}", Utc::now().format("%Y%m%dT%H%M%S%.f")));
        let mut args = os_args(["restore", "--detach", "--image-path"]);
        args.push(image_path.into());
        args.push("--work-path".into());
        args.push(work_path.into());
        args.push("--bundle".into());
        args.push(bundle.into());
        args.extend(checkpoint.restore_args().into_iter().map(OsString::from));
        if opts.no_pivot_root {
            args.push("--no-pivot".into());
        }
        args.push("--pid-file".into());
        args.push(opts.pid_file.clone().into());
        args.push(id.into());
        self.launch(args, Some(bundle), opts, io).await
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.exec_mut(os_args(["start", id])).await.map(|_| ())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.exec_mut(os_args(["delete", id])).await.map(|_| ())
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.exec_mut(os_args(["pause", id])).await.map(|_| ())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.exec_mut(os_args(["resume", id])).await.map(|_| ())
    }

    /// `checkpoint --image-path <dir> [flags] <id>`.
    pub async fn checkpoint(&self, id: &str, image_path: &Path, checkpoint: &Checkpoint) -> Result<()> {
        let mut args = os_args(["checkpoint", "--image-path"]);
        args.push(image_path.into());
        args.extend(checkpoint.checkpoint_args().into_iter().map(OsString::from));
        args.push(id.into());
        self.exec_mut(args).await.map(|_| ())
    }

    /// Loads the runtime's view of container `id` via `state`. Used for crash recovery.
    pub async fn load(&self, id: &str) -> Result<RuntimeState> {
        let output = self.query(os_args(["state", id])).await?;
        serde_json::from_slice(&output).map_err(|err| {
            Error::RuntimeQuery(format!("{} state {id}: invalid output: {err}", self.binary))
        })
    }

    /// Pids of every process in the container, via `ps --format json`.
    pub async fn ps(&self, id: &str) -> Result<Vec<i32>> {
        let output = self.query(os_args(["ps", "--format", "json", id])).await?;
        let pids: Option<Vec<i32>> = serde_json::from_slice(&output).map_err(|err| {
            Error::RuntimeQuery(format!("{} ps {id}: invalid output: {err}", self.binary))
        })?;
        Ok(pids.unwrap_or_default())
    }

    /// Resource usage of the container, the `data` of `events --stats`.
    pub async fn stats(&self, id: &str) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        struct Event {
            #[serde(rename = "type")]
            typ: String,
            #[serde(default)]
            data: serde_json::Value,
        }
        let output = self.query(os_args(["events", "--stats", id])).await?;
        let event: Event = serde_json::from_slice(&output).map_err(|err| {
            Error::RuntimeQuery(format!("{} events {id}: invalid output: {err}", self.binary))
        })?;
        if event.typ != "stats" {
            return Err(Error::RuntimeQuery(format!(
                "{} events {id}: unexpected event type {:?}",
                self.binary, event.typ
            )));
        }
        Ok(event.data)
    }
}

fn os_args<const N: usize>(args: [&str; N]) -> Vec<OsString> {
    args.into_iter().map(OsString::from).collect()
}

fn subcommand_name(args: &[OsString]) -> String {
    args.first()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default()
}
