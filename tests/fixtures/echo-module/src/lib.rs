//! Minimal module: reports its generation and the handoff blob it received.
//!
//! Handlers stay free of runtime calls; this library carries its own copy of
//! tokio that is never driven.

use im_core::ipc::{Call, Empty, IpcResponse};
use im_core::module::{HandoffBlob, ModuleArgs, ModuleError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub generation: u64,
    pub received: String,
}

static ECHO: Call<Empty, Echo> = Call::define("echo.state");

fn start(blob: HandoffBlob, args: &mut ModuleArgs) -> Result<(), ModuleError> {
    let echo = Echo {
        generation: args.generation,
        received: String::from_utf8_lossy(blob.as_bytes()).into_owned(),
    };
    ECHO.handler(&mut args.mux, move |_| {
        let echo = echo.clone();
        async move { IpcResponse::ok(echo) }
    })?;
    Ok(())
}

fn exit() -> HandoffBlob {
    HandoffBlob::new(b"echo-handoff".to_vec())
}

im_core::export_module!(start, exit);
