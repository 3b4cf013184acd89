//! Starting per-user instances from the server.
//!
//! Each instance gets a fresh secret through its environment and a port that
//! stays assigned to its uid for the life of the server. The secret never
//! appears on a command line.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use http::StatusCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::config::USER_SECRET_ENV;
use crate::mode::UserSecret;

/// How user instances are started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLaunchConfig {
    /// sudo-compatible wrapper; `None` runs the executable as the server uid.
    pub wrapper: Option<PathBuf>,
    pub executable: PathBuf,
    /// First port handed out; later uids count up from here.
    pub base_port: u16,
    /// `user-startup-<uid>.log` files go here. Output is discarded without it.
    pub log_dir: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("user instances never run as root")]
    Root,

    #[error("a user instance for uid {0} is already running")]
    AlreadyRunning(u32),

    #[error("no user port left above {0}")]
    PortsExhausted(u16),

    #[error("failed to open startup log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start user instance for uid {uid}: {source}")]
    Spawn {
        uid: u32,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LaunchError::Root => StatusCode::BAD_REQUEST,
            LaunchError::AlreadyRunning(_) => StatusCode::CONFLICT,
            LaunchError::PortsExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            LaunchError::Log { .. } | LaunchError::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Where a running instance listens and the secret its HTTP surface expects.
#[derive(Debug, Clone)]
pub struct UserRoute {
    pub port: u16,
    pub secret: UserSecret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchedUser {
    pub uid: u32,
    pub port: u16,
    pub pid: Option<u32>,
}

#[derive(Debug, Default)]
struct Instances {
    ports: HashMap<u32, u16>,
    running: HashMap<u32, UserRoute>,
}

impl Instances {
    fn port_for(&mut self, uid: u32, base: u16) -> Result<u16, LaunchError> {
        if let Some(port) = self.ports.get(&uid) {
            return Ok(*port);
        }
        let port = u16::try_from(self.ports.len())
            .ok()
            .and_then(|n| base.checked_add(n))
            .ok_or(LaunchError::PortsExhausted(base))?;
        self.ports.insert(uid, port);
        Ok(port)
    }
}

/// Launches and tracks user instances. Owned by the server runtime.
#[derive(Debug)]
pub struct UserLauncher {
    config: UserLaunchConfig,
    instances: Arc<Mutex<Instances>>,
}

impl UserLauncher {
    pub fn new(config: UserLaunchConfig) -> Self {
        Self {
            config,
            instances: Arc::new(Mutex::new(Instances::default())),
        }
    }

    /// Start an instance for `uid` with a fresh secret.
    ///
    /// Must be called inside a tokio runtime; the child is reaped by a
    /// background task that logs how it ended.
    pub fn launch(&self, uid: u32) -> Result<LaunchedUser, LaunchError> {
        if uid == 0 {
            return Err(LaunchError::Root);
        }

        let secret = UserSecret::generate();
        let port = {
            let mut instances = self.instances.lock();
            if instances.running.contains_key(&uid) {
                return Err(LaunchError::AlreadyRunning(uid));
            }
            let port = instances.port_for(uid, self.config.base_port)?;
            instances.running.insert(
                uid,
                UserRoute {
                    port,
                    secret: secret.clone(),
                },
            );
            port
        };

        let mut child = match self.spawn(uid, port, &secret) {
            Ok(child) => child,
            Err(e) => {
                self.instances.lock().running.remove(&uid);
                return Err(e);
            }
        };
        let pid = child.id();
        tracing::info!(uid, port, pid, secret = %secret.fingerprint(), "user instance launched");

        let instances = self.instances.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => tracing::info!(uid, %status, "user instance exited"),
                Ok(status) => tracing::warn!(uid, %status, "user instance terminated unexpectedly"),
                Err(e) => tracing::warn!(uid, error = %e, "could not wait for user instance"),
            }
            instances.lock().running.remove(&uid);
        });

        Ok(LaunchedUser { uid, port, pid })
    }

    /// Route to the instance for `uid`, while it runs.
    pub fn route(&self, uid: u32) -> Option<UserRoute> {
        self.instances.lock().running.get(&uid).cloned()
    }

    pub fn running(&self) -> Vec<u32> {
        let mut uids: Vec<u32> = self.instances.lock().running.keys().copied().collect();
        uids.sort_unstable();
        uids
    }

    fn spawn(&self, uid: u32, port: u16, secret: &UserSecret) -> Result<tokio::process::Child, LaunchError> {
        let (stdout, stderr) = self.startup_log(uid)?;

        let mut command = match &self.config.wrapper {
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command
                    .arg(format!("--preserve-env={}", USER_SECRET_ENV))
                    .arg("-u")
                    .arg(format!("#{}", uid))
                    .arg(&self.config.executable);
                command
            }
            None => Command::new(&self.config.executable),
        };

        command
            .arg("user")
            .arg(port.to_string())
            .env(USER_SECRET_ENV, secret.expose())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| LaunchError::Spawn { uid, source })
    }

    fn startup_log(&self, uid: u32) -> Result<(Stdio, Stdio), LaunchError> {
        let Some(dir) = &self.config.log_dir else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let path = dir.join(format!("user-startup-{}.log", uid));
        let log_error = |source| LaunchError::Log {
            path: path.clone(),
            source,
        };

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(log_error)?;
        let stderr = file.try_clone().map_err(log_error)?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}
