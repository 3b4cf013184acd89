//! The module compiled into im-core.
//!
//! It serves `connection.whoami` over IPC and `GET /status` over HTTP, and
//! carries its reload counter across generations in the handoff blob.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use super::abi::{HandoffBlob, ModuleArgs, ModuleError};
use super::loader::LoadedModule;
use crate::http::HttpResponse;
use crate::ipc::{Call, Empty, IpcResponse};

pub const MODULE_NAME: &str = "default";

/// The caller's uid as attested by the kernel.
pub static WHOAMI: Call<Empty, WhoAmI> = Call::define("connection.whoami");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoAmI {
    pub uid: u32,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub module: String,
    pub role: String,
    pub generation: u64,
    pub reloads: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Handoff {
    reloads: u64,
}

#[derive(Default)]
struct DefaultModule {
    reloads: AtomicU64,
}

impl DefaultModule {
    fn exit(&self) -> HandoffBlob {
        HandoffBlob::encode_json(&Handoff {
            reloads: self.reloads.load(Ordering::SeqCst),
        })
    }
}

fn start(module: &Arc<DefaultModule>, blob: HandoffBlob, args: &mut ModuleArgs) -> Result<(), ModuleError> {
    let reloads = blob
        .decode_json::<Handoff>()?
        .map(|h| h.reloads + 1)
        .unwrap_or(0);
    module.reloads.store(reloads, Ordering::SeqCst);

    WHOAMI.handler(&mut args.mux, |req| async move {
        IpcResponse::ok(WhoAmI { uid: req.uid })
    })?;

    let state = module.clone();
    let generation = args.generation;
    let role = args.role.as_str().to_string();
    args.mux.register_http(Method::GET, "/status", move |_| {
        let status = ModuleStatus {
            module: MODULE_NAME.to_string(),
            role: role.clone(),
            generation,
            reloads: state.reloads.load(Ordering::SeqCst),
        };
        async move { HttpResponse::json(StatusCode::OK, &status) }
    })?;

    tracing::debug!(generation, reloads, "default module started");
    Ok(())
}

/// A fresh instance of the default module.
pub fn instantiate() -> LoadedModule {
    let module = Arc::new(DefaultModule::default());
    let exiting = module.clone();
    LoadedModule::compiled_in(
        MODULE_NAME,
        move |blob, args| start(&module, blob, args),
        move || exiting.exit(),
    )
}
