//! Plugin commands.
//!
//! A plugin process runs one command and exits. Commands that need server
//! state go through the IPC socket; none of them bind anything.
//!
//! ## Usage
//!
//! ```bash
//! im-core ping                # Server generation
//! im-core reload              # Rebuild and replace the server's module
//! im-core launch 1000          # Start the user instance for uid 1000
//! im-core whoami              # Uid the server sees for this process
//! im-core config show         # Effective configuration
//! im-core whoami --parsable   # Any command, JSON output
//! ```

pub mod config_cmd;

use serde::Serialize;

use crate::config::EnvConfig;
use crate::ipc::{Empty, IpcClient, IpcError};
use crate::module::builtin::{LaunchUser, LAUNCH_USER, PING, RELOAD};
use crate::module::default::WHOAMI;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_CONNECTION: i32 = 3;

/// Run plugin command `name` and return the process exit code.
pub async fn run_plugin(name: &str, args: &[String], parsable: bool, config: &EnvConfig) -> i32 {
    let client = || IpcClient::connect(&config.ipc_socket).with_frame_limit(config.ipc_server.max_frame_size);

    match name {
        "ping" => match PING.invoke(&client(), &Empty {}).await {
            Ok(pong) if parsable => print_json(&pong),
            Ok(pong) => {
                println!("server generation {}", pong.generation);
                EXIT_OK
            }
            Err(e) => report_ipc_error(&e),
        },
        "reload" => match RELOAD.invoke(&client(), &Empty {}).await {
            Ok(report) if parsable => print_json(&report),
            Ok(report) => {
                println!(
                    "reloaded {}: generation {} -> {} in {} ms",
                    report.module, report.previous_generation, report.generation, report.elapsed_ms
                );
                EXIT_OK
            }
            Err(e) => report_ipc_error(&e),
        },
        "launch" => {
            let Some(uid) = args.first().and_then(|a| a.parse::<u32>().ok()) else {
                eprintln!("Usage: im-core launch <uid>");
                return EXIT_FAILURE;
            };
            match LAUNCH_USER.invoke(&client(), &LaunchUser { uid }).await {
                Ok(launched) if parsable => print_json(&launched),
                Ok(launched) => {
                    println!("user instance for uid {} listening on port {}", launched.uid, launched.port);
                    EXIT_OK
                }
                Err(e) => report_ipc_error(&e),
            }
        }
        "whoami" => match WHOAMI.invoke(&client(), &Empty {}).await {
            Ok(who) if parsable => print_json(&who),
            Ok(who) => {
                println!("uid {}", who.uid);
                EXIT_OK
            }
            Err(e) => report_ipc_error(&e),
        },
        "config" => match args.first().map(String::as_str).unwrap_or("show") {
            "show" => config_cmd::run_show(parsable),
            "defaults" => config_cmd::run_defaults(parsable),
            "validate" => config_cmd::run_validate(parsable),
            other => {
                eprintln!("Unknown config subcommand: {}", other);
                print_usage();
                EXIT_FAILURE
            }
        },
        "help" | "--help" | "-h" => {
            print_usage();
            EXIT_OK
        }
        "version" | "--version" | "-V" => {
            println!("im-core {}", env!("CARGO_PKG_VERSION"));
            EXIT_OK
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            EXIT_FAILURE
        }
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_string(value) {
        Ok(line) => {
            println!("{}", line);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Error: could not encode output: {}", e);
            EXIT_FAILURE
        }
    }
}

fn report_ipc_error(err: &IpcError) -> i32 {
    eprintln!("Error: {}", err);
    if err.is_transport() {
        EXIT_CONNECTION
    } else {
        EXIT_FAILURE
    }
}

pub fn print_usage() {
    println!(
        "\
im-core {}

USAGE:
    im-core [server]            Run the privileged server
    im-core user <port>         Run a per-user instance (needs IM_USER_SECRET)
    im-core proxy               Run the front proxy
    im-core <command> [args]    Run a plugin command

COMMANDS:
    ping                        Print the server's module generation
    reload                      Rebuild and replace the server's module
    launch <uid>                Start the user instance for <uid>
    whoami                      Print the uid the server attests for this process
    config show|defaults|validate
    help                        Show this message

FLAGS:
    --parsable                  JSON output

EXIT CODES:
    0 ok, 1 failure, 2 configuration error, 3 server unreachable",
        env!("CARGO_PKG_VERSION")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_socket(path: &std::path::Path) -> EnvConfig {
        let mut cfg = crate::config::defaults();
        cfg.ipc_socket = path.to_path_buf();
        cfg
    }

    #[tokio::test]
    async fn test_unknown_command_fails() {
        let cfg = crate::config::defaults();
        assert_eq!(run_plugin("frobnicate", &[], false, &cfg).await, EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_ping_without_server_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_with_socket(&dir.path().join("absent.sock"));
        assert_eq!(run_plugin("ping", &[], true, &cfg).await, EXIT_CONNECTION);
    }

    #[tokio::test]
    async fn test_help_succeeds() {
        let cfg = crate::config::defaults();
        assert_eq!(run_plugin("help", &[], false, &cfg).await, EXIT_OK);
    }

    #[tokio::test]
    async fn test_launch_needs_numeric_uid() {
        let cfg = crate::config::defaults();
        assert_eq!(run_plugin("launch", &[], false, &cfg).await, EXIT_FAILURE);
        assert_eq!(
            run_plugin("launch", &["alice".to_string()], false, &cfg).await,
            EXIT_FAILURE
        );
    }
}
