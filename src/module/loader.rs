//! Producing loadable module units.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::abi::{ExitFn, HandoffBlob, ModuleArgs, ModuleError, StartFn};
use super::dylib::DynamicLibrary;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to run build command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("build command `{command}` failed ({status}): {stderr}")]
    Build {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("module artifact {}: {source}", .path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to stage modules in {}: {reason}", .path.display())]
    WorkDir { path: PathBuf, reason: String },

    #[error("failed to open {}: {message}", .path.display())]
    Open { path: PathBuf, message: String },

    #[error("missing symbol {symbol}: {message}")]
    Symbol { symbol: String, message: String },

    #[error("module ABI version {module} does not match host version {host}")]
    AbiMismatch { host: u32, module: u32 },

    #[error("module factory failed: {0}")]
    Factory(String),
}

/// A module unit with its two entry points resolved.
#[derive(Clone)]
pub struct LoadedModule {
    pub name: String,
    pub start: StartFn,
    pub exit: ExitFn,
    /// Keeps the backing library mapped while any clone is alive.
    pub library: Option<Arc<DynamicLibrary>>,
}

impl LoadedModule {
    /// A module whose code is part of this binary.
    pub fn compiled_in<S, E>(name: impl Into<String>, start: S, exit: E) -> Self
    where
        S: Fn(HandoffBlob, &mut ModuleArgs) -> Result<(), ModuleError> + Send + Sync + 'static,
        E: Fn() -> HandoffBlob + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            start: Arc::new(start),
            exit: Arc::new(exit),
            library: None,
        }
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("library", &self.library.as_ref().map(|l| l.path().to_path_buf()))
            .finish()
    }
}

/// Builds and loads a fresh module unit on every call.
#[async_trait]
pub trait ModuleLoader: Send + Sync + 'static {
    async fn build_and_load(&self) -> Result<LoadedModule, LoadError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

type Factory = dyn Fn() -> Result<LoadedModule, LoadError> + Send + Sync;

/// Instantiates a compiled-in module. Nothing is built.
pub struct StaticLoader {
    name: String,
    factory: Arc<Factory>,
}

impl StaticLoader {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<LoadedModule, LoadError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }

    /// Loader for the module shipped with im-core.
    pub fn default_module() -> Self {
        Self::new(super::default::MODULE_NAME, || Ok(super::default::instantiate()))
    }
}

#[async_trait]
impl ModuleLoader for StaticLoader {
    async fn build_and_load(&self) -> Result<LoadedModule, LoadError> {
        (self.factory)()
    }

    fn describe(&self) -> String {
        format!("static:{}", self.name)
    }
}
