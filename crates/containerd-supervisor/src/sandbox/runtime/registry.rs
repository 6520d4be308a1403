use std::collections::HashMap;
use std::path::PathBuf;

use super::OciRuntime;
use crate::sandbox::{Error, Result};
use crate::sys::reaper::Monitor;

/// Everything a runtime constructor gets from the supervisor configuration.
#[derive(Clone)]
pub struct RuntimeOpts {
    /// Overrides the executable the constructor would pick.
    pub binary: Option<String>,
    pub root: PathBuf,
    pub args: Vec<String>,
    pub monitor: Monitor,
}

pub type RuntimeConstructor = fn(RuntimeOpts) -> OciRuntime;

/// Runtime names to constructors. Built explicitly at startup and resolved once.
#[derive(Default)]
pub struct RuntimeRegistry {
    constructors: HashMap<String, RuntimeConstructor>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the runtimes shipped with this crate: `runc` and its alias `oci`.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register("runc", runc)?;
        registry.register("oci", runc)?;
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: RuntimeConstructor) -> Result<()> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("runtime {name}")));
        }
        self.constructors.insert(name, constructor);
        Ok(())
    }

    pub fn resolve(&self, name: &str, opts: RuntimeOpts) -> Result<OciRuntime> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("runtime {name}")))?;
        Ok(constructor(opts))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

fn runc(opts: RuntimeOpts) -> OciRuntime {
    let binary = opts.binary.unwrap_or_else(|| "runc".to_string());
    OciRuntime::new(binary, Some(opts.root), opts.args, opts.monitor)
}
