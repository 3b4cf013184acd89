// Copyright 2024-2026 im-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! im-core: integration module runtime for shared multi-user hosts.
//!
//! One privileged server process and many per-user processes cooperate on a
//! host while keeping its Unix permission model intact.
//!
//! # Design Principles
//!
//! - **Kernel-attested identity**: IPC callers are identified by their peer
//!   credential only, never by anything in the payload
//! - **Live replacement**: the request-handling module is swapped atomically
//!   while sockets stay open
//! - **One role per process**: decided before anything is bound
//!
//! # Security Boundaries
//!
//! - IPC: Unix socket, mode 0666, authorization by peer uid
//! - User instances never run as root and exit when the server is gone
//! - A user instance's HTTP surface answers only requests carrying its secret
//! - Reload is restricted to root and the server's own uid

#[cfg(not(unix))]
compile_error!("im-core requires a Unix platform");

pub mod cli;
pub mod config;
pub mod http;
pub mod ipc;
pub mod launcher;
pub mod mode;
pub mod module;
pub mod shutdown;
pub mod telemetry;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use config::EnvConfig;
use ipc::{spawn_keep_alive, IpcClient, IpcServer, ServerError};
use launcher::UserLauncher;
use mode::{IpcClientMode, ProcessRole, UserSecret};
use module::{
    spawn_reload_task, ActiveHandle, DylibLoader, ModuleContext, ModuleLoader, ModuleManager,
    ReloadError, ReloadTrigger, StaticLoader,
};
use shutdown::{DrainResult, ShutdownCoordinator};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("the {0} role does not run a service")]
    NotAService(String),

    #[error("user instances require a secret")]
    MissingSecret,

    #[error("module start-up failed: {0}")]
    Module(#[from] ReloadError),

    #[error(transparent)]
    Ipc(#[from] ServerError),

    #[error("failed to bind HTTP listener on {addr}: {source}")]
    HttpBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

/// Pick the module loader for this configuration.
pub fn module_loader(config: &EnvConfig) -> Box<dyn ModuleLoader> {
    match config.module.dylib_config() {
        Some(dylib) => Box::new(DylibLoader::new(dylib)),
        None => Box::new(StaticLoader::default_module()),
    }
}

/// A running service process: server, user instance or proxy.
pub struct Runtime {
    role: ProcessRole,
    config: EnvConfig,
    manager: Arc<ModuleManager>,
    shutdown: Arc<ShutdownCoordinator>,
    client: Option<IpcClient>,
    launcher: Option<Arc<UserLauncher>>,
    http_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    http_task: Option<JoinHandle<io::Result<()>>>,
}

impl Runtime {
    /// Install the first module and bind everything the role calls for.
    ///
    /// `http_addr` is where the HTTP surface listens; port 0 picks a free port.
    /// A user instance must be given the secret its HTTP callers present;
    /// other roles ignore `secret`.
    pub async fn start(
        role: ProcessRole,
        http_addr: SocketAddr,
        config: EnvConfig,
        secret: Option<UserSecret>,
        loader: Box<dyn ModuleLoader>,
    ) -> Result<Self, RuntimeError> {
        let caps = role.capabilities();
        if !caps.runs_modules {
            return Err(RuntimeError::NotAService(role.to_string()));
        }
        let secret = match role {
            ProcessRole::User => Some(secret.ok_or(RuntimeError::MissingSecret)?),
            _ => None,
        };

        let launcher = caps
            .launches_user_instances
            .then(|| Arc::new(UserLauncher::new(config.user_launch.clone())));

        let (trigger, receiver) = ReloadTrigger::channel(8);
        let mut context = ModuleContext::new(role.clone(), config.ipc_socket.clone());
        if let Some(launcher) = &launcher {
            context = context.with_launcher(launcher.clone());
        }
        let manager = ModuleManager::start(loader, context, trigger).await?;
        let shutdown = Arc::new(ShutdownCoordinator::new());

        let mut runtime = Self {
            role,
            config,
            manager: manager.clone(),
            shutdown: shutdown.clone(),
            client: None,
            launcher,
            http_addr: None,
            tasks: vec![spawn_reload_task(manager.clone(), receiver, shutdown.token())],
            http_task: None,
        };

        if let Err(e) = runtime
            .bind(caps.binds_ipc_server, caps.binds_http, http_addr, secret)
            .await
        {
            shutdown.trigger("start-up failed");
            return Err(e);
        }

        runtime.client = match caps.ipc_client {
            IpcClientMode::Embedded => Some(IpcClient::embedded(manager.active())),
            IpcClientMode::Socket => Some(
                IpcClient::connect(&runtime.config.ipc_socket)
                    .with_frame_limit(runtime.config.ipc_server.max_frame_size),
            ),
            IpcClientMode::None => None,
        };

        if runtime.role == ProcessRole::User {
            if let Some(client) = runtime.client.clone() {
                let watchdog = spawn_keep_alive(client, runtime.config.keep_alive, shutdown.clone());
                runtime.tasks.push(watchdog);
            }
        }

        tracing::info!(
            role = %runtime.role,
            generation = manager.active().generation(),
            http = ?runtime.http_addr,
            "runtime started"
        );
        Ok(runtime)
    }

    async fn bind(
        &mut self,
        ipc: bool,
        http: bool,
        http_addr: SocketAddr,
        secret: Option<UserSecret>,
    ) -> Result<(), RuntimeError> {
        if ipc {
            let server = IpcServer::start(
                &self.config.ipc_socket,
                self.manager.active(),
                self.config.ipc_server.clone(),
                self.config.connections.clone(),
                self.shutdown.clone(),
            )?;
            self.tasks.push(server.spawn());
        }

        if http {
            let listener = http::bind(http_addr)
                .await
                .map_err(|source| RuntimeError::HttpBind { addr: http_addr, source })?;
            self.http_addr = listener.local_addr().ok();
            self.http_task = Some(http::spawn_http(
                listener,
                self.manager.active(),
                self.shutdown.clone(),
                secret,
            ));
        }
        Ok(())
    }

    pub fn role(&self) -> &ProcessRole {
        &self.role
    }

    pub fn active(&self) -> ActiveHandle {
        self.manager.active()
    }

    pub fn manager(&self) -> Arc<ModuleManager> {
        self.manager.clone()
    }

    pub fn shutdown(&self) -> Arc<ShutdownCoordinator> {
        self.shutdown.clone()
    }

    /// Client for server operations; embedded for the server itself.
    pub fn client(&self) -> Option<IpcClient> {
        self.client.clone()
    }

    /// Starts user instances; server role only.
    pub fn launcher(&self) -> Option<Arc<UserLauncher>> {
        self.launcher.clone()
    }

    /// Bound HTTP address, if this role serves HTTP.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Serve until SIGINT, SIGTERM or an internal shutdown, then drain.
    ///
    /// SIGHUP queues a module reload.
    pub async fn run(self) -> Result<DrainResult, RuntimeError> {
        let mut hangup = signal(SignalKind::hangup()).map_err(RuntimeError::Signal)?;
        let mut terminate = signal(SignalKind::terminate()).map_err(RuntimeError::Signal)?;
        let mut interrupt = signal(SignalKind::interrupt()).map_err(RuntimeError::Signal)?;
        let trigger = self.manager.trigger();

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    tracing::info!("SIGHUP received, reloading module");
                    if !trigger.signal("sighup") {
                        tracing::warn!("reload queue full, SIGHUP ignored");
                    }
                }
                _ = terminate.recv() => {
                    self.shutdown.trigger("SIGTERM");
                    break;
                }
                _ = interrupt.recv() => {
                    self.shutdown.trigger("SIGINT");
                    break;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        Ok(self.stop().await)
    }

    /// Stop accepting, drain in-flight requests and join background tasks.
    pub async fn stop(self) -> DrainResult {
        let result = self.shutdown.drain(self.config.shutdown_timeout).await;
        match &result {
            DrainResult::Complete => tracing::info!("shutdown complete"),
            DrainResult::Timeout { remaining } => {
                tracing::warn!(remaining, "shutdown timeout, requests still in flight")
            }
        }

        if let Some(http) = self.http_task {
            match tokio::time::timeout(self.config.shutdown_timeout, http).await {
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "HTTP server error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "HTTP task failed"),
                Err(_) => tracing::warn!("HTTP server did not stop in time"),
                Ok(Ok(Ok(()))) => {}
            }
        }
        for task in self.tasks {
            if tokio::time::timeout(self.config.shutdown_timeout, task).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }
        result
    }
}
