//! Live replacement of the active module.
//!
//! The active module is an immutable snapshot behind an `ArcSwap`. Request
//! paths load one snapshot and keep it until they finish; a reload builds a
//! complete new snapshot and publishes it in one store.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::abi::{HandoffBlob, ModuleArgs, ModuleError, MODULE_ABI_VERSION};
use super::builtin::{self, BuiltinContext};
use super::loader::{LoadError, LoadedModule, ModuleLoader};
use crate::ipc::Multiplexer;
use crate::launcher::UserLauncher;
use crate::mode::ProcessRole;
use crate::telemetry::{log_security_event, SecurityEvent};

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("a reload is already in progress")]
    InProgress,

    #[error("module build or load failed: {0}")]
    Load(#[from] LoadError),

    #[error("new module failed to start: {reason}")]
    StartFailed { reason: String, restored: bool },

    #[error("initial module start failed: {0}")]
    Initial(#[source] ModuleError),

    #[error("reload service unavailable")]
    Unavailable,
}

impl ReloadError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InProgress => StatusCode::CONFLICT,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Load(_) | Self::StartFailed { .. } | Self::Initial(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Outcome of a successful reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub module: String,
    pub previous_generation: u64,
    pub generation: u64,
    pub elapsed_ms: u64,
    pub origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Active,
    Reloading,
}

/// One installed module generation and its routes.
pub struct ActiveModule {
    generation: u64,
    activated_at: DateTime<Utc>,
    mux: Multiplexer,
    retired: AtomicBool,
    // Declared last: the routes above may run code from this module's
    // library and must be dropped before it is unmapped.
    module: LoadedModule,
}

impl ActiveModule {
    fn new(module: LoadedModule, generation: u64, mux: Multiplexer) -> Self {
        Self {
            generation,
            activated_at: Utc::now(),
            mux,
            retired: AtomicBool::new(false),
            module,
        }
    }

    pub fn name(&self) -> &str {
        &self.module.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn activated_at(&self) -> DateTime<Utc> {
        self.activated_at
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Run the module's exit once. Later calls return `None`.
    fn retire(&self) -> Option<HandoffBlob> {
        if self.retired.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some((self.module.exit)())
    }
}

impl std::fmt::Debug for ActiveModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveModule")
            .field("name", &self.module.name)
            .field("generation", &self.generation)
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Shared, lock-free view of the active module.
#[derive(Clone)]
pub struct ActiveHandle(Arc<ArcSwap<ActiveModule>>);

impl ActiveHandle {
    fn new(module: ActiveModule) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(module)))
    }

    /// Current snapshot. Hold it for the whole request.
    pub fn load(&self) -> Arc<ActiveModule> {
        self.0.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.0.load().generation
    }

    fn publish(&self, module: ActiveModule) -> Arc<ActiveModule> {
        self.0.swap(Arc::new(module))
    }
}

/// Reload request sent to the reload task.
pub struct ReloadRequest {
    origin: &'static str,
    reply: Option<oneshot::Sender<Result<ReloadReport, ReloadError>>>,
}

impl ReloadRequest {
    fn respond(self, result: Result<ReloadReport, ReloadError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

/// Sending side of the reload channel; fed by SIGHUP and `im.reload`.
#[derive(Clone)]
pub struct ReloadTrigger {
    tx: mpsc::Sender<ReloadRequest>,
}

pub struct ReloadReceiver {
    rx: mpsc::Receiver<ReloadRequest>,
}

impl ReloadTrigger {
    pub fn channel(capacity: usize) -> (Self, ReloadReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReloadReceiver { rx })
    }

    /// Request a reload and wait for its outcome.
    pub async fn request(&self, origin: &'static str) -> Result<ReloadReport, ReloadError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(ReloadRequest {
                origin,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ReloadError::Unavailable)?;
        outcome.await.map_err(|_| ReloadError::Unavailable)?
    }

    /// Request a reload without waiting. Returns false if it was not queued.
    pub fn signal(&self, origin: &'static str) -> bool {
        self.tx
            .try_send(ReloadRequest {
                origin,
                reply: None,
            })
            .is_ok()
    }
}

/// Fixed facts about the process modules run in.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub role: ProcessRole,
    pub ipc_socket: PathBuf,
    /// Only this uid and root may call `im.reload` and `im.launch_user`.
    pub server_uid: u32,
    /// Present in the server, which is the only role that starts user instances.
    pub launcher: Option<Arc<UserLauncher>>,
}

impl ModuleContext {
    pub fn new(role: ProcessRole, ipc_socket: impl Into<PathBuf>) -> Self {
        // SAFETY: getuid cannot fail.
        let server_uid = unsafe { libc::getuid() };
        Self {
            role,
            ipc_socket: ipc_socket.into(),
            server_uid,
            launcher: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<UserLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }
}

/// Owns the active module and performs reloads.
pub struct ModuleManager {
    loader: Box<dyn ModuleLoader>,
    context: ModuleContext,
    trigger: ReloadTrigger,
    active: ActiveHandle,
    state: RwLock<ModuleState>,
    reload_lock: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    reloads: AtomicU64,
    undelivered: Mutex<Option<HandoffBlob>>,
}

impl ModuleManager {
    /// Build, load and start the first module with an empty handoff blob.
    pub async fn start(
        loader: Box<dyn ModuleLoader>,
        context: ModuleContext,
        trigger: ReloadTrigger,
    ) -> Result<Arc<Self>, ReloadError> {
        let loaded = loader.build_and_load().await?;
        let module = activate(&context, &trigger, &loaded, HandoffBlob::empty(), 1)
            .map_err(ReloadError::Initial)?;
        tracing::info!(module = %loaded.name, loader = %loader.describe(), generation = 1, "module installed");

        Ok(Arc::new(Self {
            loader,
            context,
            trigger,
            active: ActiveHandle::new(module),
            state: RwLock::new(ModuleState::Active),
            reload_lock: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(2),
            reloads: AtomicU64::new(0),
            undelivered: Mutex::new(None),
        }))
    }

    pub fn active(&self) -> ActiveHandle {
        self.active.clone()
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }

    /// Number of successful reloads.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) -> ReloadTrigger {
        self.trigger.clone()
    }

    /// Replace the active module with a freshly built one.
    ///
    /// Build and load failures leave the current module untouched. If the new
    /// module fails to start, the previous module is started again on fresh
    /// routes with the same handoff blob.
    pub async fn reload(&self, origin: &str) -> Result<ReloadReport, ReloadError> {
        let Ok(_exclusive) = self.reload_lock.try_lock() else {
            return Err(ReloadError::InProgress);
        };
        let _reloading = ReloadingGuard::enter(&self.state);
        let started = Instant::now();
        let previous = self.active.load();

        tracing::info!(origin, module = %previous.name(), generation = previous.generation(), "module reload started");

        let loaded = match self.loader.build_and_load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                let error = e.to_string();
                log_security_event(
                    SecurityEvent::ModuleReloadFailed,
                    "module build failed, keeping current module",
                    &[("origin", origin), ("error", &error)],
                );
                return Err(e.into());
            }
        };

        let blob = previous
            .retire()
            .or_else(|| self.undelivered.lock().take())
            .unwrap_or_default();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        match activate(&self.context, &self.trigger, &loaded, blob.clone(), generation) {
            Ok(module) => {
                self.active.publish(module);
                self.reloads.fetch_add(1, Ordering::SeqCst);
                let report = ReloadReport {
                    module: loaded.name.clone(),
                    previous_generation: previous.generation(),
                    generation,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    origin: origin.to_string(),
                };
                log_security_event(
                    SecurityEvent::ModuleReloaded,
                    "module replaced",
                    &[
                        ("origin", origin),
                        ("module", &report.module),
                        ("generation", &generation.to_string()),
                    ],
                );
                Ok(report)
            }
            Err(e) => {
                let reason = e.to_string();
                let restored = match activate(
                    &self.context,
                    &self.trigger,
                    &previous.module,
                    blob.clone(),
                    previous.generation(),
                ) {
                    Ok(module) => {
                        self.active.publish(module);
                        true
                    }
                    Err(restart) => {
                        tracing::error!(error = %restart, "previous module failed to restart");
                        *self.undelivered.lock() = Some(blob);
                        false
                    }
                };
                log_security_event(
                    SecurityEvent::ModuleReloadFailed,
                    "new module failed to start",
                    &[
                        ("origin", origin),
                        ("error", &reason),
                        ("restored", if restored { "true" } else { "false" }),
                    ],
                );
                Err(ReloadError::StartFailed { reason, restored })
            }
        }
    }
}

struct ReloadingGuard<'a>(&'a RwLock<ModuleState>);

impl<'a> ReloadingGuard<'a> {
    fn enter(state: &'a RwLock<ModuleState>) -> Self {
        *state.write() = ModuleState::Reloading;
        Self(state)
    }
}

impl Drop for ReloadingGuard<'_> {
    fn drop(&mut self) {
        *self.0.write() = ModuleState::Active;
    }
}

/// Start `loaded` on a fresh multiplexer and wrap it as a snapshot.
fn activate(
    context: &ModuleContext,
    trigger: &ReloadTrigger,
    loaded: &LoadedModule,
    blob: HandoffBlob,
    generation: u64,
) -> Result<ActiveModule, ModuleError> {
    let mut mux = Multiplexer::new();
    builtin::register(
        &mut mux,
        BuiltinContext {
            generation,
            trigger: trigger.clone(),
            server_uid: context.server_uid,
            launcher: context.launcher.clone(),
        },
    )?;

    let mut args = ModuleArgs {
        abi_version: MODULE_ABI_VERSION,
        role: context.role.clone(),
        ipc_socket: context.ipc_socket.clone(),
        generation,
        mux,
    };
    args.validate()?;
    (loaded.start)(blob, &mut args)?;

    Ok(ActiveModule::new(loaded.clone(), generation, args.mux))
}

/// Serve reload requests one at a time until `token` is cancelled.
///
/// Requests arriving while a reload runs are answered with `InProgress`.
pub fn spawn_reload_task(
    manager: Arc<ModuleManager>,
    receiver: ReloadReceiver,
    token: CancellationToken,
) -> JoinHandle<()> {
    let ReloadReceiver { mut rx } = receiver;
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = token.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let reload = manager.reload(request.origin);
            tokio::pin!(reload);
            let result = loop {
                tokio::select! {
                    result = &mut reload => break result,
                    Some(other) = rx.recv() => other.respond(Err(ReloadError::InProgress)),
                }
            };

            if let Err(e) = &result {
                tracing::warn!(origin = request.origin, error = %e, "reload failed");
            }
            request.respond(result);
        }
        tracing::debug!("reload task stopped");
    })
}
