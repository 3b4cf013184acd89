//! Runtime configuration loading from environment variables.
//!
//! All values come from `IM_*` environment variables with sensible defaults.
//! Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `IM_IPC_SOCKET` | `/var/run/ucloud/ucloud.sock` | IPC socket path |
//! | `IM_HTTP_ADDR` | `127.0.0.1:42000` | HTTP listen address (server/proxy) |
//! | `IM_USER_SECRET` | - | Shared secret required by user instances |
//! | `IM_ALLOW_ROOT` | false | Permit the server role to run as root |
//! | `IM_MAX_CONNECTIONS` | 256 | Max concurrent IPC connections |
//! | `IM_IPC_FRAME_LIMIT` | 4194304 | Max IPC frame size (bytes) |
//! | `IM_SHUTDOWN_TIMEOUT` | 30 | Graceful shutdown timeout (secs) |
//! | `IM_PING_INTERVAL` | 10 | User keep-alive ping interval (secs) |
//! | `IM_PING_MAX_FAILURES` | 3 | Failed pings before a user instance exits |
//! | `IM_MODULE_SOURCE` | - | Module source tree; unset uses the built-in module |
//! | `IM_MODULE_BUILD_CMD` | `cargo build --release --lib` | Module build command |
//! | `IM_MODULE_ARTIFACT` | `target/release/libim_module.so` | Built library, relative to the source |
//! | `IM_MODULE_WORK_DIR` | `$TMPDIR/im-modules-<euid>` | Private (0700) staging directory for loaded libraries |
//! | `IM_USER_LAUNCHER` | `sudo` | Wrapper that switches to the user; `direct` runs without one |
//! | `IM_USER_EXE` | this binary | Executable started for user instances |
//! | `IM_USER_BASE_PORT` | HTTP port + 1 | First port handed to a user instance |
//! | `IM_LOG_FORMAT` | json | `json` or `pretty` |
//! | `IM_LOG_LEVEL` | info | Tracing filter directive |
//! | `IM_LOG_DIR` | - | Write `<role>.log` files here instead of stderr |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::ipc::{ConnectionConfig, IpcServerConfig};
use crate::launcher::UserLaunchConfig;
use crate::telemetry::LogFormat;

pub const DEFAULT_IPC_SOCKET: &str = "/var/run/ucloud/ucloud.sock";
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:42000";
pub const USER_SECRET_ENV: &str = "IM_USER_SECRET";

const DEFAULT_FRAME: usize = 4 * 1024 * 1024;
const MIN_FRAME: usize = 4096;

/// How the module implementation is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSourceConfig {
    /// Use the module compiled into this binary.
    Builtin,
    /// Build and dlopen a module crate from a source tree.
    Dylib {
        source_dir: PathBuf,
        build_command: Vec<String>,
        artifact: PathBuf,
        work_dir: PathBuf,
    },
}

/// Ping watchdog settings for user instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub interval: Duration,
    pub max_failures: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_failures: 3,
        }
    }
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub ipc_socket: PathBuf,
    pub http_addr: SocketAddr,
    pub allow_root: bool,
    pub ipc_server: IpcServerConfig,
    pub connections: ConnectionConfig,
    pub shutdown_timeout: Duration,
    pub keep_alive: KeepAliveConfig,
    pub module: ModuleSourceConfig,
    pub user_launch: UserLaunchConfig,
    pub log_format: LogFormat,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

/// Effective configuration summary, printed by `im-core config show`.
///
/// The user secret is deliberately absent.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub ipc_socket: String,
    pub http_addr: String,
    pub allow_root: bool,
    pub max_connections: usize,
    pub ipc_frame_limit: usize,
    pub shutdown_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub ping_max_failures: u32,
    pub module_source: Option<String>,
    pub module_build_cmd: Option<String>,
    pub module_artifact: Option<String>,
    pub user_launcher: String,
    pub user_executable: String,
    pub user_base_port: u16,
    pub log_format: String,
    pub log_level: String,
    pub log_dir: Option<String>,
}

/// Source of raw values; the process environment outside of `defaults()`.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a `usize` var, returning `default` on missing or invalid.
fn parse_usize(get: Lookup<'_>, key: &str, default: usize) -> usize {
    get(key)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

/// Parse a `u64` var, returning `default` on missing or invalid.
fn parse_u64(get: Lookup<'_>, key: &str, default: u64) -> u64 {
    get(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_bool(get: Lookup<'_>, key: &str, default: bool) -> bool {
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn load_http_addr(get: Lookup<'_>) -> SocketAddr {
    let fallback: SocketAddr = ([127, 0, 0, 1], 42000).into();
    get("IM_HTTP_ADDR")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

fn load_ipc_server_config(get: Lookup<'_>) -> IpcServerConfig {
    let max_frame_size = parse_usize(get, "IM_IPC_FRAME_LIMIT", DEFAULT_FRAME).max(MIN_FRAME);
    IpcServerConfig { max_frame_size }
}

fn load_connection_config(get: Lookup<'_>) -> ConnectionConfig {
    let max_connections = parse_usize(get, "IM_MAX_CONNECTIONS", 256).max(1);
    ConnectionConfig { max_connections }
}

fn load_keep_alive(get: Lookup<'_>) -> KeepAliveConfig {
    let interval = parse_u64(get, "IM_PING_INTERVAL", 10).max(1);
    let max_failures = parse_u64(get, "IM_PING_MAX_FAILURES", 3).clamp(1, u32::MAX as u64) as u32;
    KeepAliveConfig {
        interval: Duration::from_secs(interval),
        max_failures,
    }
}

fn load_module_config(get: Lookup<'_>) -> ModuleSourceConfig {
    let Some(source) = get("IM_MODULE_SOURCE") else {
        return ModuleSourceConfig::Builtin;
    };

    let build_command: Vec<String> = get("IM_MODULE_BUILD_CMD")
        .unwrap_or_else(|| "cargo build --release --lib".to_string())
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let artifact = get("IM_MODULE_ARTIFACT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("target/release/libim_module.so"));
    let work_dir = get("IM_MODULE_WORK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(default_work_dir);

    ModuleSourceConfig::Dylib {
        source_dir: PathBuf::from(source),
        build_command,
        artifact,
        work_dir,
    }
}

fn load_user_launch(get: Lookup<'_>, http_addr: SocketAddr, log_dir: Option<PathBuf>) -> UserLaunchConfig {
    let wrapper = match get("IM_USER_LAUNCHER") {
        Some(v) if v.trim().eq_ignore_ascii_case("direct") => None,
        Some(v) => Some(PathBuf::from(v.trim())),
        None => Some(PathBuf::from("sudo")),
    };
    let executable = get("IM_USER_EXE")
        .map(PathBuf::from)
        .or_else(|| std::env::current_exe().ok())
        .unwrap_or_else(|| PathBuf::from("im-core"));
    let base_port = get("IM_USER_BASE_PORT")
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|p| *p != 0)
        .unwrap_or_else(|| http_addr.port().saturating_add(1));

    UserLaunchConfig {
        wrapper,
        executable,
        base_port,
        log_dir,
    }
}

/// Per-uid so that users on the same host never share a staging directory.
fn default_work_dir() -> PathBuf {
    // SAFETY: geteuid cannot fail.
    let euid = unsafe { libc::geteuid() };
    std::env::temp_dir().join(format!("im-modules-{}", euid))
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    load_from(&env_string)
}

/// Configuration with every variable unset.
pub fn defaults() -> EnvConfig {
    load_from(&|_| None)
}

fn load_from(get: Lookup<'_>) -> EnvConfig {
    let ipc_socket = get("IM_IPC_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_IPC_SOCKET));
    let shutdown_secs = parse_u64(get, "IM_SHUTDOWN_TIMEOUT", 30).max(1);
    let http_addr = load_http_addr(get);
    let log_dir = get("IM_LOG_DIR").map(PathBuf::from);

    EnvConfig {
        ipc_socket,
        http_addr,
        allow_root: parse_bool(get, "IM_ALLOW_ROOT", false),
        ipc_server: load_ipc_server_config(get),
        connections: load_connection_config(get),
        shutdown_timeout: Duration::from_secs(shutdown_secs),
        keep_alive: load_keep_alive(get),
        module: load_module_config(get),
        user_launch: load_user_launch(get, http_addr, log_dir.clone()),
        log_format: get("IM_LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or_default(),
        log_level: get("IM_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        log_dir,
    }
}

/// Read the user secret. Empty or whitespace-only values count as missing.
pub fn user_secret_from_env() -> Option<String> {
    env_string(USER_SECRET_ENV)
}

impl ModuleSourceConfig {
    /// Loader settings when a module source tree is configured.
    pub fn dylib_config(&self) -> Option<crate::module::DylibLoaderConfig> {
        match self {
            ModuleSourceConfig::Builtin => None,
            ModuleSourceConfig::Dylib {
                source_dir,
                build_command,
                artifact,
                work_dir,
            } => Some(crate::module::DylibLoaderConfig {
                source_dir: source_dir.clone(),
                build_command: build_command.clone(),
                artifact: artifact.clone(),
                work_dir: work_dir.clone(),
            }),
        }
    }
}

/// A configuration value that will not work at run time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("IM_IPC_SOCKET must be an absolute path, got {0}")]
    RelativeSocket(String),

    #[error("IM_MODULE_SOURCE is not a directory: {0}")]
    MissingModuleSource(String),

    #[error("IM_LOG_LEVEL is not a valid filter: {0}")]
    InvalidLogLevel(String),

    #[error("IM_LOG_DIR is not a directory: {0}")]
    MissingLogDir(String),
}

impl EnvConfig {
    /// Check values that parse but cannot work. Returns every problem found.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();

        if !self.ipc_socket.is_absolute() {
            problems.push(ConfigError::RelativeSocket(self.ipc_socket.display().to_string()));
        }
        if let ModuleSourceConfig::Dylib { source_dir, .. } = &self.module {
            if !source_dir.is_dir() {
                problems.push(ConfigError::MissingModuleSource(source_dir.display().to_string()));
            }
        }
        if EnvFilter::try_new(&self.log_level).is_err() {
            problems.push(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        if let Some(dir) = &self.log_dir {
            if !dir.is_dir() {
                problems.push(ConfigError::MissingLogDir(dir.display().to_string()));
            }
        }

        problems
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        let (module_source, module_build_cmd, module_artifact) = match &self.module {
            ModuleSourceConfig::Builtin => (None, None, None),
            ModuleSourceConfig::Dylib {
                source_dir,
                build_command,
                artifact,
                ..
            } => (
                Some(source_dir.display().to_string()),
                Some(build_command.join(" ")),
                Some(artifact.display().to_string()),
            ),
        };

        EffectiveConfig {
            ipc_socket: self.ipc_socket.display().to_string(),
            http_addr: self.http_addr.to_string(),
            allow_root: self.allow_root,
            max_connections: self.connections.max_connections,
            ipc_frame_limit: self.ipc_server.max_frame_size,
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            ping_interval_secs: self.keep_alive.interval.as_secs(),
            ping_max_failures: self.keep_alive.max_failures,
            module_source,
            module_build_cmd,
            module_artifact,
            user_launcher: self
                .user_launch
                .wrapper
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "direct".to_string()),
            user_executable: self.user_launch.executable.display().to_string(),
            user_base_port: self.user_launch.base_port,
            log_format: match self.log_format {
                LogFormat::Json => "json".to_string(),
                LogFormat::Pretty => "pretty".to_string(),
            },
            log_level: self.log_level.clone(),
            log_dir: self.log_dir.as_ref().map(|p| p.display().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "IM_IPC_SOCKET",
        "IM_HTTP_ADDR",
        "IM_ALLOW_ROOT",
        "IM_MAX_CONNECTIONS",
        "IM_IPC_FRAME_LIMIT",
        "IM_SHUTDOWN_TIMEOUT",
        "IM_PING_INTERVAL",
        "IM_PING_MAX_FAILURES",
        "IM_MODULE_SOURCE",
        "IM_MODULE_BUILD_CMD",
        "IM_MODULE_ARTIFACT",
        "IM_MODULE_WORK_DIR",
        "IM_USER_LAUNCHER",
        "IM_USER_EXE",
        "IM_USER_BASE_PORT",
        "IM_LOG_FORMAT",
        "IM_LOG_LEVEL",
        "IM_LOG_DIR",
        "IM_USER_SECRET",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.ipc_socket, PathBuf::from(DEFAULT_IPC_SOCKET));
        assert_eq!(cfg.http_addr.to_string(), DEFAULT_HTTP_ADDR);
        assert!(!cfg.allow_root);
        assert_eq!(cfg.connections.max_connections, 256);
        assert_eq!(cfg.ipc_server.max_frame_size, 4 * 1024 * 1024);
        assert_eq!(cfg.shutdown_timeout.as_secs(), 30);
        assert_eq!(cfg.keep_alive, KeepAliveConfig::default());
        assert_eq!(cfg.module, ModuleSourceConfig::Builtin);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("IM_IPC_SOCKET", "/tmp/im.sock");
        std::env::set_var("IM_HTTP_ADDR", "0.0.0.0:8080");
        std::env::set_var("IM_ALLOW_ROOT", "yes");
        std::env::set_var("IM_MAX_CONNECTIONS", "16");
        std::env::set_var("IM_PING_MAX_FAILURES", "5");
        std::env::set_var("IM_LOG_FORMAT", "pretty");
        let cfg = load();
        assert_eq!(cfg.ipc_socket, PathBuf::from("/tmp/im.sock"));
        assert_eq!(cfg.http_addr.port(), 8080);
        assert!(cfg.allow_root);
        assert_eq!(cfg.connections.max_connections, 16);
        assert_eq!(cfg.keep_alive.max_failures, 5);
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("IM_HTTP_ADDR", "not an address");
        std::env::set_var("IM_MAX_CONNECTIONS", "abc");
        std::env::set_var("IM_ALLOW_ROOT", "maybe");
        let cfg = load();
        assert_eq!(cfg.http_addr.to_string(), DEFAULT_HTTP_ADDR);
        assert_eq!(cfg.connections.max_connections, 256);
        assert!(!cfg.allow_root);
        clear_env_vars();
    }

    #[test]
    fn test_floors_apply() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("IM_IPC_FRAME_LIMIT", "0");
        std::env::set_var("IM_MAX_CONNECTIONS", "0");
        std::env::set_var("IM_SHUTDOWN_TIMEOUT", "0");
        std::env::set_var("IM_PING_INTERVAL", "0");
        let cfg = load();
        assert_eq!(cfg.ipc_server.max_frame_size, MIN_FRAME);
        assert_eq!(cfg.connections.max_connections, 1);
        assert_eq!(cfg.shutdown_timeout.as_secs(), 1);
        assert_eq!(cfg.keep_alive.interval.as_secs(), 1);
        clear_env_vars();
    }

    #[test]
    fn test_module_source_selects_dylib() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("IM_MODULE_SOURCE", "/opt/im/module");
        std::env::set_var("IM_MODULE_BUILD_CMD", "make  module");
        let cfg = load();
        match cfg.module {
            ModuleSourceConfig::Dylib {
                source_dir,
                build_command,
                artifact,
                ..
            } => {
                assert_eq!(source_dir, PathBuf::from("/opt/im/module"));
                assert_eq!(build_command, vec!["make".to_string(), "module".to_string()]);
                assert_eq!(artifact, PathBuf::from("target/release/libim_module.so"));
            }
            other => panic!("expected dylib module config, got {:?}", other),
        }
        clear_env_vars();
    }

    #[test]
    fn test_user_launch_settings() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.user_launch.wrapper, Some(PathBuf::from("sudo")));
        assert_eq!(cfg.user_launch.base_port, 42001);

        std::env::set_var("IM_USER_LAUNCHER", "direct");
        std::env::set_var("IM_USER_EXE", "/opt/im/im-core");
        std::env::set_var("IM_USER_BASE_PORT", "50000");
        std::env::set_var("IM_LOG_DIR", "/var/log/im");
        let cfg = load();
        assert!(cfg.user_launch.wrapper.is_none());
        assert_eq!(cfg.user_launch.executable, PathBuf::from("/opt/im/im-core"));
        assert_eq!(cfg.user_launch.base_port, 50000);
        assert_eq!(cfg.user_launch.log_dir, Some(PathBuf::from("/var/log/im")));
        assert_eq!(cfg.effective_config().user_launcher, "direct");
        clear_env_vars();
    }

    #[test]
    fn test_blank_secret_counts_as_missing() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var(USER_SECRET_ENV, "   ");
        assert!(user_secret_from_env().is_none());
        std::env::set_var(USER_SECRET_ENV, "s3cret");
        assert_eq!(user_secret_from_env().as_deref(), Some("s3cret"));
        clear_env_vars();
    }

    #[test]
    fn test_defaults_ignore_environment() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("IM_MAX_CONNECTIONS", "7");
        assert_eq!(defaults().connections.max_connections, 256);
        clear_env_vars();
    }

    #[test]
    fn test_validate_reports_each_problem() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        assert!(defaults().validate().is_empty());

        std::env::set_var("IM_IPC_SOCKET", "relative.sock");
        std::env::set_var("IM_MODULE_SOURCE", "/nonexistent/im-module");
        std::env::set_var("IM_LOG_LEVEL", "im_core=loud");
        let problems = load().validate();
        assert_eq!(problems.len(), 3, "{:?}", problems);
        assert!(problems.contains(&ConfigError::RelativeSocket("relative.sock".into())));
        clear_env_vars();
    }

    #[test]
    fn test_effective_config_omits_secret() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var(USER_SECRET_ENV, "do-not-print");
        let eff = load().effective_config();
        let rendered = serde_json::to_string(&eff).unwrap();
        assert!(!rendered.contains("do-not-print"));
        assert!(eff.module_source.is_none());
        clear_env_vars();
    }
}
