// Copyright 2024-2026 im-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Building and loading modules as shared libraries.

use std::ffi::{c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::abi::{
    RawAbiVersionFn, RawExitFn, RawStartFn, ABI_VERSION_SYMBOL, EXIT_SYMBOL, MODULE_ABI_VERSION,
    START_SYMBOL,
};
use super::loader::{LoadError, LoadedModule, ModuleLoader};

/// Build output kept in error messages.
const STDERR_TAIL: usize = 2048;

/// An open `dlopen` handle. Closed on drop.
pub struct DynamicLibrary {
    handle: *mut c_void,
    path: PathBuf,
}

// SAFETY: a dlopen handle is a process-global token; dlsym and dlclose may be
// called on it from any thread.
unsafe impl Send for DynamicLibrary {}
unsafe impl Sync for DynamicLibrary {}

impl DynamicLibrary {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| LoadError::Open {
            path: path.to_path_buf(),
            message: "path contains a NUL byte".into(),
        })?;

        // SAFETY: c_path is a valid NUL-terminated string for the duration of
        // the call.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(LoadError::Open {
                path: path.to_path_buf(),
                message: last_dl_error(),
            });
        }

        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve `symbol`, which must be NUL-terminated.
    pub fn symbol(&self, symbol: &[u8]) -> Result<*mut c_void, LoadError> {
        let name = CStr::from_bytes_with_nul(symbol).map_err(|_| LoadError::Symbol {
            symbol: String::from_utf8_lossy(symbol).into_owned(),
            message: "symbol name is not NUL-terminated".into(),
        })?;

        // SAFETY: handle is open until drop and name is NUL-terminated.
        let ptr = unsafe { libc::dlsym(self.handle, name.as_ptr()) };
        if ptr.is_null() {
            return Err(LoadError::Symbol {
                symbol: name.to_string_lossy().into_owned(),
                message: last_dl_error(),
            });
        }
        Ok(ptr)
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful dlopen and is closed once.
        unsafe {
            libc::dlclose(self.handle);
        }
        tracing::debug!(path = %self.path.display(), "module library unloaded");
        let _ = std::fs::remove_file(&self.path);
    }
}

impl std::fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicLibrary").field("path", &self.path).finish()
    }
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns null or a thread-local NUL-terminated string.
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dynamic loader error".to_string()
    } else {
        // SAFETY: checked non-null above.
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

/// Where and how a module crate is built.
#[derive(Debug, Clone)]
pub struct DylibLoaderConfig {
    pub source_dir: PathBuf,
    /// Program and arguments; empty skips the build step.
    pub build_command: Vec<String>,
    /// Built library, relative to `source_dir` unless absolute.
    pub artifact: PathBuf,
    /// Directory the library is copied to before loading.
    pub work_dir: PathBuf,
}

/// Builds a module crate from source and loads it with `dlopen`.
pub struct DylibLoader {
    config: DylibLoaderConfig,
    attempts: AtomicU64,
}

impl DylibLoader {
    pub fn new(config: DylibLoaderConfig) -> Self {
        Self {
            config,
            attempts: AtomicU64::new(0),
        }
    }

    async fn build(&self) -> Result<(), LoadError> {
        let Some((program, args)) = self.config.build_command.split_first() else {
            return Ok(());
        };
        let command = self.config.build_command.join(" ");
        tracing::info!(%command, dir = %self.config.source_dir.display(), "building module");

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.config.source_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| LoadError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
            let tail_start = (tail_start..stderr.len())
                .find(|i| stderr.is_char_boundary(*i))
                .unwrap_or(stderr.len());
            return Err(LoadError::Build {
                command,
                status: output.status.to_string(),
                stderr: stderr[tail_start..].trim().to_string(),
            });
        }
        Ok(())
    }

    /// Copy the artifact under a name never used before in this process.
    ///
    /// The dynamic linker returns the already-mapped library for a path it
    /// has seen, which would hand back the old code.
    async fn stage(&self) -> Result<PathBuf, LoadError> {
        let artifact = self.config.source_dir.join(&self.config.artifact);
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let stem = artifact
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let ext = artifact
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "so".to_string());
        let staged = self
            .config
            .work_dir
            .join(format!("{}-{}-{}.{}", stem, std::process::id(), attempt, ext));

        prepare_work_dir(&self.config.work_dir)?;

        let mut source = tokio::fs::File::open(&artifact)
            .await
            .map_err(|source| LoadError::Artifact {
                path: artifact.clone(),
                source,
            })?;
        let mut target = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&staged)
            .await
            .map_err(|source| LoadError::Artifact {
                path: staged.clone(),
                source,
            })?;
        if let Err(source) = tokio::io::copy(&mut source, &mut target).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(LoadError::Artifact { path: staged, source });
        }
        Ok(staged)
    }
}

/// Create the staging directory if needed and check nobody else can write
/// into it. Whatever lands there is loaded into this process.
fn prepare_work_dir(dir: &Path) -> Result<(), LoadError> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|source| LoadError::Artifact {
            path: dir.to_path_buf(),
            source,
        })?;

    let refuse = |reason: String| LoadError::WorkDir {
        path: dir.to_path_buf(),
        reason,
    };
    let meta = std::fs::symlink_metadata(dir).map_err(|source| LoadError::Artifact {
        path: dir.to_path_buf(),
        source,
    })?;
    if !meta.file_type().is_dir() {
        return Err(refuse("not a directory".to_string()));
    }
    // SAFETY: geteuid cannot fail.
    let euid = unsafe { libc::geteuid() };
    if meta.uid() != euid {
        return Err(refuse(format!("owned by uid {}, expected {}", meta.uid(), euid)));
    }
    if meta.mode() & 0o022 != 0 {
        return Err(refuse(format!("mode {:o} is writable by others", meta.mode() & 0o777)));
    }
    Ok(())
}

#[async_trait]
impl ModuleLoader for DylibLoader {
    async fn build_and_load(&self) -> Result<LoadedModule, LoadError> {
        self.build().await?;
        let staged = self.stage().await?;
        let library = match DynamicLibrary::open(&staged) {
            Ok(library) => Arc::new(library),
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e);
            }
        };

        let abi_ptr = library.symbol(ABI_VERSION_SYMBOL)?;
        // SAFETY: export_module! defines this symbol as `extern "C" fn() -> u32`.
        let abi_version: RawAbiVersionFn = unsafe { std::mem::transmute(abi_ptr) };
        // SAFETY: the function takes no arguments and only returns a constant.
        let module_abi = unsafe { abi_version() };
        if module_abi != MODULE_ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                host: MODULE_ABI_VERSION,
                module: module_abi,
            });
        }

        let start_ptr = library.symbol(START_SYMBOL)?;
        let exit_ptr = library.symbol(EXIT_SYMBOL)?;
        // SAFETY: the ABI version matched, so both symbols were generated by
        // export_module! with exactly these signatures. The library Arc is
        // stored next to the pointers and outlives every call through them.
        let raw_start: RawStartFn = unsafe { std::mem::transmute(start_ptr) };
        let raw_exit: RawExitFn = unsafe { std::mem::transmute(exit_ptr) };

        let name = staged
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dylib".to_string());
        tracing::info!(module = %name, "module library loaded");

        Ok(LoadedModule {
            name,
            start: Arc::new(raw_start),
            exit: Arc::new(raw_exit),
            library: Some(library),
        })
    }

    fn describe(&self) -> String {
        format!("dylib:{}", self.config.source_dir.display())
    }
}
