//! Operations present in every module generation.

use std::sync::Arc;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::manager::{ReloadReport, ReloadTrigger};
use crate::ipc::{Call, Empty, IpcRequest, IpcResponse, Multiplexer, MuxError};
use crate::launcher::{LaunchedUser, UserLauncher};
use crate::telemetry::{log_security_event, SecurityEvent};

/// Liveness check; answers with the serving generation.
pub static PING: Call<Empty, Pong> = Call::define("im.ping");

/// Rebuild and replace the active module. Operator only.
pub static RELOAD: Call<Empty, ReloadReport> = Call::define("im.reload");

/// Start the user instance for a uid. Operator only, server role only.
pub static LAUNCH_USER: Call<LaunchUser, LaunchedUser> = Call::define("im.launch_user");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchUser {
    pub uid: u32,
}

pub(crate) struct BuiltinContext {
    pub generation: u64,
    pub trigger: ReloadTrigger,
    pub server_uid: u32,
    pub launcher: Option<Arc<UserLauncher>>,
}

/// Refuse `req` unless it comes from root or the server's own uid.
fn deny_non_operator<Req, Resp>(req: &IpcRequest<Req>, server_uid: u32, what: &str) -> Option<IpcResponse<Resp>> {
    if req.uid == 0 || req.uid == server_uid {
        return None;
    }
    let uid = req.uid.to_string();
    log_security_event(
        SecurityEvent::OperatorCallDenied,
        &format!("{} requested by unprivileged caller", what),
        &[("call", req.operation), ("uid", &uid)],
    );
    Some(IpcResponse::error(
        StatusCode::FORBIDDEN,
        format!("{} is restricted to the operator", what),
    ))
}

pub(crate) fn register(mux: &mut Multiplexer, ctx: BuiltinContext) -> Result<(), MuxError> {
    let generation = ctx.generation;
    PING.handler(mux, move |_| async move { IpcResponse::ok(Pong { generation }) })?;

    let trigger = ctx.trigger;
    let server_uid = ctx.server_uid;
    RELOAD.handler(mux, move |req| {
        let trigger = trigger.clone();
        async move {
            if let Some(denied) = deny_non_operator(&req, server_uid, "reload") {
                return denied;
            }

            match trigger.request("ipc").await {
                Ok(report) => IpcResponse::ok(report),
                Err(e) => IpcResponse::error(e.status_code(), e.to_string()),
            }
        }
    })?;

    if let Some(launcher) = ctx.launcher {
        LAUNCH_USER.handler(mux, move |req| {
            let launcher = launcher.clone();
            async move {
                if let Some(denied) = deny_non_operator(&req, server_uid, "launching user instances") {
                    return denied;
                }
                match launcher.launch(req.payload.uid) {
                    Ok(launched) => IpcResponse::ok(launched),
                    Err(e) => IpcResponse::error(e.status_code(), e.to_string()),
                }
            }
        })?;
    }

    Ok(())
}
