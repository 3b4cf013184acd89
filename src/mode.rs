//! Process role selection.
//!
//! Exactly one role is chosen per process, from the first argument, before
//! anything is bound. The role then fixes what the process may do.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config;

pub const PARSABLE_FLAG: &str = "--parsable";

/// What this process is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessRole {
    /// Privileged instance owning the IPC socket and the module lifecycle.
    Server,
    /// Per-user instance running under the end user's uid.
    User,
    /// Front proxy instance.
    Proxy,
    /// One-shot plugin command.
    Plugin(String),
}

impl ProcessRole {
    /// Role from the first command-line argument; none means `Server`.
    pub fn from_args(args: &[String]) -> Self {
        match args.first().map(String::as_str) {
            None | Some("server") => Self::Server,
            Some("user") => Self::User,
            Some("proxy") => Self::Proxy,
            Some(other) => Self::Plugin(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Server => "server",
            Self::User => "user",
            Self::Proxy => "proxy",
            Self::Plugin(name) => name,
        }
    }

    /// Name of this role's log file, without extension.
    pub fn log_module(&self, uid: u32, now_unix: i64) -> String {
        match self {
            Self::Server => "server".to_string(),
            Self::User => format!("user-{}", uid),
            Self::Proxy => "frontend-proxy".to_string(),
            Self::Plugin(_) => format!("plugin-{}", now_unix),
        }
    }

    pub fn capabilities(&self) -> RoleCapabilities {
        RoleCapabilities::for_role(self)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin(name) => write!(f, "plugin:{}", name),
            other => f.write_str(other.as_str()),
        }
    }
}

/// How a role reaches the server's operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcClientMode {
    None,
    Socket,
    Embedded,
}

/// What a role is allowed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleCapabilities {
    pub binds_ipc_server: bool,
    pub ipc_client: IpcClientMode,
    pub runs_modules: bool,
    pub binds_http: bool,
    pub launches_user_instances: bool,
}

impl RoleCapabilities {
    pub fn for_role(role: &ProcessRole) -> Self {
        match role {
            ProcessRole::Server => Self {
                binds_ipc_server: true,
                ipc_client: IpcClientMode::Embedded,
                runs_modules: true,
                binds_http: true,
                launches_user_instances: true,
            },
            ProcessRole::User => Self {
                binds_ipc_server: false,
                ipc_client: IpcClientMode::Socket,
                runs_modules: true,
                binds_http: true,
                launches_user_instances: false,
            },
            ProcessRole::Proxy => Self {
                binds_ipc_server: false,
                ipc_client: IpcClientMode::None,
                runs_modules: true,
                binds_http: true,
                launches_user_instances: false,
            },
            ProcessRole::Plugin(_) => Self {
                binds_ipc_server: false,
                ipc_client: IpcClientMode::Socket,
                runs_modules: false,
                binds_http: false,
                launches_user_instances: false,
            },
        }
    }
}

/// Shared secret handed to user instances by the server.
#[derive(Clone, PartialEq, Eq)]
pub struct UserSecret(String);

impl UserSecret {
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            None
        } else {
            Some(Self(secret))
        }
    }

    /// Fresh random secret for a newly launched user instance.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compare a presented secret without leaking where it differs.
    ///
    /// Both sides are hashed first so their lengths do not matter either.
    pub fn matches(&self, presented: &[u8]) -> bool {
        let expected = Sha256::digest(self.0.as_bytes());
        let presented = Sha256::digest(presented);
        expected.as_slice().ct_eq(presented.as_slice()).into()
    }

    /// Short SHA-256 prefix, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(digest)[..12].to_string()
    }
}

impl fmt::Debug for UserSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserSecret({})", self.fingerprint())
    }
}

/// Everything role selection looks at.
#[derive(Debug, Clone, Default)]
pub struct StartupInputs {
    /// Arguments after the program name.
    pub args: Vec<String>,
    pub user_secret: Option<String>,
}

impl StartupInputs {
    pub fn from_env() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            user_secret: config::user_secret_from_env(),
        }
    }
}

/// Outcome of role selection.
#[derive(Debug, Clone)]
pub struct RoleSelection {
    pub role: ProcessRole,
    pub secret: Option<UserSecret>,
    /// HTTP port of a user instance.
    pub user_port: Option<u16>,
    /// Plugin arguments after the command name, without `--parsable`.
    pub plugin_args: Vec<String>,
    pub parsable: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModeError {
    #[error("user instances require {} to be set", config::USER_SECRET_ENV)]
    MissingSecret,

    #[error("user instances require an HTTP port argument")]
    MissingPort,

    #[error("invalid HTTP port: {0:?}")]
    InvalidPort(String),

    #[error("refusing to run the {role} role as root")]
    RootRefused { role: String },
}

/// Decide this process's role. Nothing is bound here.
pub fn select_role(inputs: &StartupInputs) -> Result<RoleSelection, ModeError> {
    let role = ProcessRole::from_args(&inputs.args);
    let mut selection = RoleSelection {
        role: role.clone(),
        secret: None,
        user_port: None,
        plugin_args: Vec::new(),
        parsable: false,
    };

    match role {
        ProcessRole::User => {
            let secret = inputs
                .user_secret
                .clone()
                .and_then(UserSecret::new)
                .ok_or(ModeError::MissingSecret)?;
            let port = inputs.args.get(1).ok_or(ModeError::MissingPort)?;
            let port: u16 = port
                .parse()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ModeError::InvalidPort(port.clone()))?;
            selection.secret = Some(secret);
            selection.user_port = Some(port);
        }
        ProcessRole::Plugin(_) => {
            for arg in inputs.args.iter().skip(1) {
                if arg == PARSABLE_FLAG {
                    selection.parsable = true;
                } else {
                    selection.plugin_args.push(arg.clone());
                }
            }
        }
        ProcessRole::Server | ProcessRole::Proxy => {}
    }

    Ok(selection)
}

/// Refuse identities a role must never run under.
pub fn verify_identity(role: &ProcessRole, uid: u32, allow_root: bool) -> Result<(), ModeError> {
    if uid != 0 {
        return Ok(());
    }
    match role {
        ProcessRole::User | ProcessRole::Proxy => Err(ModeError::RootRefused {
            role: role.as_str().to_string(),
        }),
        ProcessRole::Server if !allow_root => Err(ModeError::RootRefused {
            role: role.as_str().to_string(),
        }),
        _ => Ok(()),
    }
}
