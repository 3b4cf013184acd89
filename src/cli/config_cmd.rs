//! Config plugin commands: show, defaults, validate.
//!
//! These read configuration directly from environment variables without
//! contacting a running server.

use crate::config::{self, EffectiveConfig};

/// Print the effective configuration.
pub fn run_show(parsable: bool) -> i32 {
    print_config(&config::load().effective_config(), parsable)
}

/// Print the configuration with no environment overrides.
pub fn run_defaults(parsable: bool) -> i32 {
    print_config(&config::defaults().effective_config(), parsable)
}

/// Validate configuration for values that parse but cannot work.
///
/// Returns 0 if valid, 2 if any problems are found.
pub fn run_validate(parsable: bool) -> i32 {
    let problems: Vec<String> = config::load()
        .validate()
        .iter()
        .map(ToString::to_string)
        .collect();

    if parsable {
        println!("{}", serde_json::json!({ "valid": problems.is_empty(), "problems": problems }));
    } else if problems.is_empty() {
        println!("Configuration is valid.");
    } else {
        for problem in &problems {
            eprintln!("WARNING: {}", problem);
        }
    }

    if problems.is_empty() {
        super::EXIT_OK
    } else {
        super::EXIT_CONFIG
    }
}

fn print_config(cfg: &EffectiveConfig, parsable: bool) -> i32 {
    if parsable {
        return super::print_json(cfg);
    }

    let unset = || "-".to_string();
    println!("IM_IPC_SOCKET={}", cfg.ipc_socket);
    println!("IM_HTTP_ADDR={}", cfg.http_addr);
    println!("IM_ALLOW_ROOT={}", cfg.allow_root);
    println!("IM_MAX_CONNECTIONS={}", cfg.max_connections);
    println!("IM_IPC_FRAME_LIMIT={}", cfg.ipc_frame_limit);
    println!("IM_SHUTDOWN_TIMEOUT={}", cfg.shutdown_timeout_secs);
    println!("IM_PING_INTERVAL={}", cfg.ping_interval_secs);
    println!("IM_PING_MAX_FAILURES={}", cfg.ping_max_failures);
    println!("IM_MODULE_SOURCE={}", cfg.module_source.clone().unwrap_or_else(unset));
    println!("IM_MODULE_BUILD_CMD={}", cfg.module_build_cmd.clone().unwrap_or_else(unset));
    println!("IM_MODULE_ARTIFACT={}", cfg.module_artifact.clone().unwrap_or_else(unset));
    println!("IM_LOG_FORMAT={}", cfg.log_format);
    println!("IM_LOG_LEVEL={}", cfg.log_level);
    println!("IM_LOG_DIR={}", cfg.log_dir.clone().unwrap_or_else(unset));
    super::EXIT_OK
}
