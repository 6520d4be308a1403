//! A container: its init process, its exec processes and its checkpoints.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use nix::sys::signal::Signal;
use oci_spec::runtime::{Process as ProcessSpec, Spec};
use tokio_util::sync::CancellationToken;

use crate::sandbox::checkpoint::{Checkpoint, CheckpointStore, InFlight};
use crate::sandbox::process::{Process, ProcessOpts};
use crate::sandbox::process_state::{ProcessState, Stdio, root_ids};
use crate::sandbox::runtime::OciRuntime;
use crate::sandbox::state::{ContainerStatus, ProcessStatus};
use crate::sandbox::utils::{validate_name, write_atomic};
use crate::sandbox::{Error, Result};
use crate::sys::shim::{INIT_PROCESS_ID, NewProcessOpts, ShimDriver};

/// Records the bundle path so a restarted supervisor can find it.
pub const BUNDLE_FILE: &str = "bundle";

/// What a container needs from the supervisor that owns it.
#[derive(Clone)]
pub(crate) struct ContainerContext {
    pub runtime: OciRuntime,
    pub driver: ShimDriver,
    pub no_pivot_root: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub bundle: PathBuf,
    pub stdio: Stdio,
    /// Name of a checkpoint of the bundle to restore instead of starting fresh.
    pub checkpoint: Option<String>,
}

type Processes = RwLock<HashMap<String, Arc<Process>>>;

pub struct Container {
    id: String,
    bundle: PathBuf,
    dir: PathBuf,
    ctx: ContainerContext,
    root_ids: (u32, u32),
    status: RwLock<ContainerStatus>,
    processes: Processes,
    // serializes everything that adds or removes processes
    lock: tokio::sync::Mutex<()>,
    in_flight: InFlight,
    checkpoints: CheckpointStore,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("bundle", &self.bundle)
            .field("status", &self.status())
            .finish()
    }
}

impl Container {
    fn new(
        id: &str,
        bundle: PathBuf,
        dir: PathBuf,
        ctx: ContainerContext,
        root_ids: (u32, u32),
        status: ContainerStatus,
    ) -> Self {
        Self {
            id: id.to_string(),
            checkpoints: CheckpointStore::new(&bundle),
            bundle,
            dir,
            ctx,
            root_ids,
            status: RwLock::new(status),
            processes: RwLock::default(),
            lock: tokio::sync::Mutex::new(()),
            in_flight: InFlight::default(),
        }
    }

    /// Creates the container state directory in `dir` and launches the init process.
    /// Nothing is left on disk if this fails.
    pub(crate) async fn create(
        ctx: ContainerContext,
        id: &str,
        dir: PathBuf,
        opts: CreateOpts,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        match fs::create_dir(&dir) {
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(id.to_string()));
            }
            res => res?,
        }

        let res = Self::create_in(ctx, id, dir.clone(), opts, cancel).await;
        if res.is_err() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                log::warn!("failed to remove {}: {err}", dir.display());
            }
        }
        res
    }

    async fn create_in(
        ctx: ContainerContext,
        id: &str,
        dir: PathBuf,
        opts: CreateOpts,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let CreateOpts {
            bundle,
            stdio,
            checkpoint,
        } = opts;
        write_atomic(&dir.join(BUNDLE_FILE), bundle.to_string_lossy().as_bytes())?;

        let spec = load_spec(&bundle)?;
        let process = init_process_spec(&spec)?;

        let status = if checkpoint.is_some() {
            ContainerStatus::Running
        } else {
            ContainerStatus::Created
        };
        let container = Arc::new(Self::new(id, bundle, dir, ctx, root_ids(&spec), status));

        let image = match checkpoint {
            Some(name) => {
                container.checkpoints.get(&name)?;
                Some(container.checkpoints.path(&name))
            }
            None => None,
        };

        let init = container
            .spawn_process(INIT_PROCESS_ID, process, false, stdio, image, cancel)
            .await?;
        container.track(init);

        log::info!("created container {id}");
        Ok(container)
    }

    /// Rebuilds a container from its state directory.
    pub(crate) async fn load(ctx: ContainerContext, id: &str, dir: PathBuf) -> Result<Arc<Self>> {
        let bundle = PathBuf::from(fs::read_to_string(dir.join(BUNDLE_FILE))?);

        let init_dir = dir.join(INIT_PROCESS_ID);
        let init = ShimDriver::load_process(&init_dir)?;
        let root_ids = (init.state.root_uid, init.state.root_gid);

        let status = match ctx.runtime.load(id).await {
            Ok(state) => match state.status.as_str() {
                "created" => ContainerStatus::Created,
                "paused" => ContainerStatus::Paused,
                "stopped" => ContainerStatus::Stopped,
                _ => ContainerStatus::Running,
            },
            Err(err) => {
                log::warn!("runtime state of container {id} unavailable: {err}");
                ContainerStatus::Running
            }
        };

        let monitor = ctx.driver.monitor().clone();
        let container = Arc::new(Self::new(id, bundle, dir.clone(), ctx, root_ids, status));

        let init_status = match (init.status, status) {
            (ProcessStatus::Running, ContainerStatus::Created) => ProcessStatus::Created,
            (status, _) => status,
        };
        let opts = container.process_opts(INIT_PROCESS_ID, false, init.state.stdio());
        container.track(Process::loaded(opts, init, init_status, &monitor));

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == INIT_PROCESS_ID || !entry.file_type()?.is_dir() {
                continue;
            }
            match ShimDriver::load_process(&entry.path()) {
                Ok(loaded) => {
                    let status = loaded.status;
                    let opts = container.process_opts(&name, true, loaded.state.stdio());
                    container.track(Process::loaded(opts, loaded, status, &monitor));
                }
                Err(err) => log::warn!("skipping process {name} of container {id}: {err}"),
            }
        }

        log::info!("loaded container {id} ({})", container.status());
        Ok(container)
    }

    fn process_opts(&self, id: &str, exec: bool, stdio: Stdio) -> ProcessOpts {
        ProcessOpts {
            id: id.to_string(),
            container_id: self.id.clone(),
            exec,
            stdio,
            dir: self.dir.join(id),
            checkpoints: self.in_flight.clone(),
        }
    }

    async fn spawn_process(
        &self,
        id: &str,
        process: ProcessSpec,
        exec: bool,
        stdio: Stdio,
        image: Option<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Process>> {
        let opts = self.process_opts(id, exec, stdio.clone());
        let restore = image.is_some();
        let state = ProcessState {
            process,
            exec,
            stdin: stdio.stdin,
            stdout: stdio.stdout,
            stderr: stdio.stderr,
            runtime_args: self.ctx.runtime.global_args(),
            no_pivot_root: self.ctx.no_pivot_root,
            checkpoint: image
                .map(|image| image.to_string_lossy().into_owned())
                .unwrap_or_default(),
            root_uid: self.root_ids.0,
            root_gid: self.root_ids.1,
        };

        let spawned = self
            .ctx
            .driver
            .new_process(
                NewProcessOpts {
                    container_id: self.id.clone(),
                    bundle: self.bundle.clone(),
                    dir: opts.dir.clone(),
                    state,
                },
                cancel,
            )
            .await?;

        let process = Process::spawned(opts, spawned);
        // exec'd and restored processes are running as soon as they have a pid
        if exec || restore {
            process.mark_running();
        }
        log::info!(
            "container {} process {id} has pid {} ({})",
            self.id,
            process.pid(),
            process.status()
        );
        Ok(process)
    }

    /// Adds `process` and reaps its exit status in the background.
    fn track(&self, process: Arc<Process>) {
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(process.id().to_string(), process.clone());

        tokio::spawn(async move {
            match process.wait().await {
                Ok(code) => log::info!(
                    "container {} process {} exited with status {code}",
                    process.container_id(),
                    process.id()
                ),
                Err(err) => log::warn!(
                    "container {} process {}: {err}",
                    process.container_id(),
                    process.id()
                ),
            }
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    /// Stopped as soon as the init process is, whatever the last recorded state.
    pub fn status(&self) -> ContainerStatus {
        let init_stopped = self
            .init()
            .map(|init| init.status() == ProcessStatus::Stopped)
            .unwrap_or(true);
        if init_stopped {
            ContainerStatus::Stopped
        } else {
            *self.status.read().unwrap_or_else(|e| e.into_inner())
        }
    }

    fn set_status(&self, status: ContainerStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn init(&self) -> Result<Arc<Process>> {
        self.process(INIT_PROCESS_ID)
    }

    pub fn process(&self, id: &str) -> Result<Arc<Process>> {
        let process = self
            .processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned();
        process.ok_or_else(|| Error::NotFound(format!("process {id} in container {}", self.id)))
    }

    pub fn processes(&self) -> Vec<Arc<Process>> {
        let mut processes: Vec<_> = self
            .processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        processes.sort_by(|a, b| a.id().cmp(b.id()));
        processes
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn start(&self) -> Result<()> {
        let mut next = self.status();
        next.start()?;
        let init = self.init()?;
        // the status only catches up once the exit status has been read
        if init.exited().try_wait().is_some() {
            return Err(Error::FailedPrecondition(format!(
                "init process of container {} has exited",
                self.id
            )));
        }

        self.ctx.runtime.start(&self.id).await?;
        self.set_status(next);
        init.mark_running();
        log::info!("started container {}", self.id);
        Ok(())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn pause(&self) -> Result<()> {
        let mut next = self.status();
        next.pause()?;
        self.ctx.runtime.pause(&self.id).await?;
        self.set_status(next);
        Ok(())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn resume(&self) -> Result<()> {
        let mut next = self.status();
        next.resume()?;
        self.ctx.runtime.resume(&self.id).await?;
        self.set_status(next);
        Ok(())
    }

    /// Starts an additional process in the running container.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn exec(
        &self,
        id: &str,
        process: ProcessSpec,
        stdio: Stdio,
        cancel: &CancellationToken,
    ) -> Result<Arc<Process>> {
        validate_name("exec id", id)?;
        if id == INIT_PROCESS_ID {
            return Err(Error::InvalidArgument(format!(
                "exec id {id:?} is reserved for the init process"
            )));
        }
        if process.terminal() == Some(true) {
            return Err(Error::InvalidArgument("terminal is not supported".to_string()));
        }

        let _guard = self.lock.lock().await;
        if self.process(id).is_ok() {
            return Err(Error::AlreadyExists(format!(
                "process {id} in container {}",
                self.id
            )));
        }
        let status = self.status();
        if status != ContainerStatus::Running {
            return Err(Error::FailedPrecondition(format!(
                "cannot exec in a container in the '{status}' state"
            )));
        }

        let process = self
            .spawn_process(id, process, true, stdio, None, cancel)
            .await?;
        self.track(process.clone());
        Ok(process)
    }

    pub fn signal(&self, process_id: &str, signal: Signal) -> Result<()> {
        self.process(process_id)?.signal(signal)
    }

    /// Pids of every process in the container, as reported by the runtime.
    pub async fn pids(&self) -> Result<Vec<i32>> {
        self.ctx.runtime.ps(&self.id).await
    }

    pub async fn stats(&self) -> Result<serde_json::Value> {
        self.ctx.runtime.stats(&self.id).await
    }

    /// Forgets a stopped exec process and removes its state directory.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn delete_process(&self, id: &str) -> Result<()> {
        if id == INIT_PROCESS_ID {
            return Err(Error::InvalidArgument(
                "the init process is deleted together with its container".to_string(),
            ));
        }
        let _guard = self.lock.lock().await;
        self.process(id)?.remove()?;
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    /// Removes every trace of the container from disk, then deletes it from the runtime.
    /// The init process must have stopped.
    ///
    /// The container is gone even if the runtime fails to delete it, which it does once it
    /// has already forgotten the container. That failure is still returned.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let init = self.init()?;
        if init.status() != ProcessStatus::Stopped {
            return Err(Error::FailedPrecondition(format!(
                "cannot delete a container in the '{}' state",
                self.status()
            )));
        }

        match fs::remove_dir_all(&self.dir) {
            Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        self.ctx.runtime.delete(&self.id).await?;
        log::info!("deleted container {}", self.id);
        Ok(())
    }

    /// True once [`Container::delete`] removed the container's state.
    pub(crate) fn is_deleted(&self) -> bool {
        self.processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Checkpoints the container into its bundle. The container keeps running unless
    /// `checkpoint.exit` is set.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn checkpoint(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let status = self.status();
        if !matches!(status, ContainerStatus::Running | ContainerStatus::Paused) {
            return Err(Error::FailedPrecondition(format!(
                "cannot checkpoint a container in the '{status}' state"
            )));
        }
        let _in_flight = self.in_flight.enter();
        self.checkpoints
            .create(&self.ctx.runtime, &self.id, checkpoint)
            .await
    }

    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.checkpoints.list()
    }

    pub fn delete_checkpoint(&self, name: &str) -> Result<()> {
        self.checkpoints.delete(name)
    }

    /// Replaces the stopped init process with one restored from checkpoint `name`.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn restore(
        &self,
        name: &str,
        stdio: Stdio,
        cancel: &CancellationToken,
    ) -> Result<Arc<Process>> {
        let _guard = self.lock.lock().await;
        let old = self.init()?;
        if old.status() != ProcessStatus::Stopped {
            return Err(Error::FailedPrecondition(format!(
                "cannot restore a container in the '{}' state",
                self.status()
            )));
        }
        self.checkpoints.get(name)?;
        let image = self.checkpoints.path(name);
        let process = init_process_spec(&load_spec(&self.bundle)?)?;

        if let Err(err) = self.ctx.runtime.delete(&self.id).await {
            log::warn!("deleting container {} before restoring it: {err}", self.id);
        }
        old.remove()?;

        let init = self
            .spawn_process(INIT_PROCESS_ID, process, false, stdio, Some(image), cancel)
            .await?;
        self.set_status(ContainerStatus::Running);
        self.track(init.clone());
        log::info!("restored container {} from checkpoint {name}", self.id);
        Ok(init)
    }
}

fn load_spec(bundle: &Path) -> Result<Spec> {
    Spec::load(bundle.join("config.json")).map_err(|err| {
        Error::InvalidArgument(format!("could not load runtime spec: {err}"))
    })
}

fn init_process_spec(spec: &Spec) -> Result<ProcessSpec> {
    let process = spec
        .process()
        .clone()
        .ok_or_else(|| Error::InvalidArgument("process is not set in runtime spec".to_string()))?;
    if process.terminal() == Some(true) {
        return Err(Error::InvalidArgument("terminal is not supported".to_string()));
    }
    Ok(process)
}
