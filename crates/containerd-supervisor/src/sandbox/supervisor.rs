use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::{LevelFilter, debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::sandbox::config::Config;
use crate::sandbox::container::{Container, ContainerContext, CreateOpts};
use crate::sandbox::runtime::{RuntimeOpts, RuntimeRegistry};
use crate::sandbox::utils::validate_name;
use crate::sandbox::{Error, Result};
use crate::sys::reaper::Monitor;
use crate::sys::shim::ShimDriver;


type Containers = RwLock<HashMap<String, Arc<Container>>>;

/// Supervisor owns every container and the state directory they live in.
/// Containers are driven through shims, so it can be restarted without
/// disturbing them; [`Supervisor::load`] picks them up again.
pub struct Supervisor {
    root: PathBuf,
    ctx: ContainerContext,
    containers: Containers,
}

impl Supervisor {
    /// Creates a supervisor from `config`, resolving its runtime in `registry`.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub fn new(config: &Config, registry: &RuntimeRegistry, monitor: Monitor) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        let runtime = registry.resolve(
            &config.runtime,
            RuntimeOpts {
                binary: config.runtime_binary.clone(),
                root: config.runtime_root.clone(),
                args: config.runtime_args.clone(),
                monitor: monitor.clone(),
            },
        )?;
        let log_level = config.log_level.parse::<LevelFilter>().map_err(|_| {
            Error::InvalidArgument(format!("invalid log level {:?}", config.log_level))
        })?;
        let driver = ShimDriver::new(
            &config.shim,
            runtime.binary(),
            monitor,
            config.start_timeout(),
        )
        .with_log_level(log_level);
        Ok(Self {
            root: config.root.clone(),
            ctx: ContainerContext {
                runtime,
                driver,
                no_pivot_root: config.no_pivot_root,
            },
            containers: RwLock::default(),
        })
    }

    fn containers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Container>>> {
        self.containers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn containers_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Container>>> {
        self.containers.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Container>> {
        let container = self.containers().get(id).cloned();
        container.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Every container, sorted by id.
    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut containers: Vec<_> = self.containers().values().cloned().collect();
        containers.sort_by(|a, b| a.id().cmp(b.id()));
        containers
    }

    /// Creates container `id` from `opts.bundle` and launches its init process.
    /// The container is left in the created state unless it was restored from a checkpoint.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn create(
        &self,
        id: &str,
        opts: CreateOpts,
        cancel: &CancellationToken,
    ) -> Result<Arc<Container>> {
        validate_name("container id", id)?;
        if !opts.bundle.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "bundle path {} is not absolute",
                opts.bundle.display()
            )));
        }
        if self.containers().contains_key(id) {
            return Err(Error::AlreadyExists(id.to_string()));
        }

        // a concurrent create of the same id fails on the state directory
        let container =
            Container::create(self.ctx.clone(), id, self.root.join(id), opts, cancel).await?;
        self.containers_mut()
            .insert(id.to_string(), container.clone());
        Ok(container)
    }

    /// Deletes a container whose init process has stopped.
    ///
    /// A runtime error is returned after the container has been forgotten, it is not
    /// retried.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let container = self.get(id)?;
        let res = container.delete().await;
        if container.is_deleted() {
            self.containers_mut().remove(id);
        }
        res
    }

    /// Picks up the containers left in the state directory by a previous supervisor.
    /// Containers that can't be loaded are skipped. Returns the ids that were loaded.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn load(&self) -> Result<Vec<String>> {
        let mut loaded = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if self.containers().contains_key(&id) {
                debug!("container {id} is already loaded");
                continue;
            }
            match Container::load(self.ctx.clone(), &id, entry.path()).await {
                Ok(container) => {
                    self.containers_mut().insert(id.clone(), container);
                    loaded.push(id);
                }
                Err(err) => warn!("skipping container {id}: {err}"),
            }
        }
        loaded.sort();
        info!("loaded {} containers from {}", loaded.len(), self.root.display());
        Ok(loaded)
    }
}
