// Copyright 2024-2026 im-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! im-core entry point.
//!
//! ## Roles
//!
//! - `im-core` or `im-core server` - privileged server (IPC socket, modules, HTTP)
//! - `im-core user <port>` - per-user instance, requires `IM_USER_SECRET`
//! - `im-core proxy` - front proxy
//! - `im-core <command>` - plugin command, see `im-core help`

use std::net::SocketAddr;
use std::process::ExitCode;

use im_core::cli::{self, EXIT_CONFIG, EXIT_FAILURE};
use im_core::config;
use im_core::mode::{self, ProcessRole, RoleSelection, StartupInputs};
use im_core::shutdown::DrainResult;
use im_core::telemetry::{init_logging, log_security_event, LogConfig, SecurityEvent};
use im_core::{module_loader, Runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let inputs = StartupInputs::from_env();
    let config = config::load();

    // SAFETY: getuid cannot fail.
    let uid = unsafe { libc::getuid() };
    let role_hint = ProcessRole::from_args(&inputs.args);
    let log = LogConfig {
        format: config.log_format,
        level: config.log_level.clone(),
        directory: config.log_dir.clone(),
        module: role_hint.log_module(uid, chrono::Utc::now().timestamp()),
    };
    if let Err(e) = init_logging(&log) {
        eprintln!("Logging initialization failed: {}", e);
        return exit(EXIT_CONFIG);
    }

    let selection = match mode::select_role(&inputs) {
        Ok(selection) => selection,
        Err(e) => {
            let event = match e {
                mode::ModeError::MissingSecret => SecurityEvent::MissingSecret,
                _ => SecurityEvent::RoleRefused,
            };
            log_security_event(event, &e.to_string(), &[("role", role_hint.as_str())]);
            eprintln!("Error: {}", e);
            return exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = mode::verify_identity(&selection.role, uid, config.allow_root) {
        let uid = uid.to_string();
        log_security_event(
            SecurityEvent::RoleRefused,
            &e.to_string(),
            &[("role", selection.role.as_str()), ("uid", &uid)],
        );
        eprintln!("Error: {}", e);
        return exit(EXIT_CONFIG);
    }

    if let Some(secret) = &selection.secret {
        tracing::info!(secret = %secret.fingerprint(), "user secret present");
    }

    match &selection.role {
        ProcessRole::Plugin(name) => {
            let code = cli::run_plugin(name, &selection.plugin_args, selection.parsable, &config).await;
            exit(code)
        }
        _ => serve(selection, config).await,
    }
}

async fn serve(selection: RoleSelection, config: config::EnvConfig) -> ExitCode {
    let http_addr = match selection.user_port {
        Some(port) => SocketAddr::new(config.http_addr.ip(), port),
        None => config.http_addr,
    };
    let loader = module_loader(&config);

    let runtime = match Runtime::start(selection.role, http_addr, config, selection.secret, loader).await {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "start-up failed");
            eprintln!("Error: {}", e);
            return exit(EXIT_CONFIG);
        }
    };

    match runtime.run().await {
        Ok(DrainResult::Complete) => ExitCode::SUCCESS,
        Ok(DrainResult::Timeout { remaining }) => {
            eprintln!("Shutdown timeout, {} requests remaining", remaining);
            exit(EXIT_FAILURE)
        }
        Err(e) => {
            tracing::error!(error = %e, "runtime error");
            eprintln!("Error: {}", e);
            exit(EXIT_FAILURE)
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}
