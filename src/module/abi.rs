//! Contract between the host and a module implementation.
//!
//! A module exposes two entry points. `start` receives the handoff blob of
//! its predecessor and registers its routes on the multiplexer in
//! [`ModuleArgs`]. `exit` returns the blob for its successor.
//!
//! Dynamically loaded modules must be built with the same toolchain and the
//! same im-core version as the host, because both entry points use the Rust
//! ABI. [`MODULE_ABI_VERSION`] guards against the obvious mismatches.

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::ipc::{Multiplexer, MuxError};
use crate::mode::ProcessRole;

/// Bumped whenever `ModuleArgs`, `HandoffBlob` or the entry point
/// signatures change.
pub const MODULE_ABI_VERSION: u32 = 1;

pub const ABI_VERSION_SYMBOL: &[u8] = b"im_module_abi_version\0";
pub const START_SYMBOL: &[u8] = b"im_module_start\0";
pub const EXIT_SYMBOL: &[u8] = b"im_module_exit\0";

/// Opaque state passed from a retiring module to its successor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffBlob(Vec<u8>);

impl HandoffBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Encode `state` as JSON. Encoding failures yield an empty blob.
    pub fn encode_json<T: Serialize>(state: &T) -> Self {
        match serde_json::to_vec(state) {
            Ok(bytes) => Self(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "handoff state not encodable, passing empty blob");
                Self::default()
            }
        }
    }

    /// Decode JSON state; `None` for an empty blob.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<Option<T>, ModuleError> {
        if self.0.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.0)
            .map(Some)
            .map_err(|e| ModuleError::Handoff(e.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("module ABI version {module} does not match host version {host}")]
    AbiMismatch { host: u32, module: u32 },

    #[error("invalid module arguments: {0}")]
    InvalidArgs(String),

    #[error("route registration failed: {0}")]
    Registration(#[from] MuxError),

    #[error("handoff state unreadable: {0}")]
    Handoff(String),

    #[error("module start failed: {0}")]
    Start(String),
}

/// Arguments handed to a module's `start`.
#[derive(Debug)]
pub struct ModuleArgs {
    pub abi_version: u32,
    pub role: ProcessRole,
    pub ipc_socket: PathBuf,
    /// Generation number this start will be published under.
    pub generation: u64,
    /// Fresh multiplexer with the core built-ins already registered.
    pub mux: Multiplexer,
}

impl ModuleArgs {
    pub fn validate(&self) -> Result<(), ModuleError> {
        if self.abi_version != MODULE_ABI_VERSION {
            return Err(ModuleError::AbiMismatch {
                host: MODULE_ABI_VERSION,
                module: self.abi_version,
            });
        }
        if self.generation == 0 {
            return Err(ModuleError::InvalidArgs("generation must be positive".into()));
        }
        Ok(())
    }
}

pub type StartFn = Arc<dyn Fn(HandoffBlob, &mut ModuleArgs) -> Result<(), ModuleError> + Send + Sync>;
pub type ExitFn = Arc<dyn Fn() -> HandoffBlob + Send + Sync>;

/// Signatures of the symbols generated by [`export_module!`](crate::export_module).
pub type RawAbiVersionFn = unsafe extern "C" fn() -> u32;
pub type RawStartFn = fn(HandoffBlob, &mut ModuleArgs) -> Result<(), ModuleError>;
pub type RawExitFn = fn() -> HandoffBlob;

/// Export a module's entry points from a `cdylib`/`dylib` crate.
///
/// ```ignore
/// fn start(blob: HandoffBlob, args: &mut ModuleArgs) -> Result<(), ModuleError> { ... }
/// fn exit() -> HandoffBlob { ... }
///
/// im_core::export_module!(start, exit);
/// ```
#[macro_export]
macro_rules! export_module {
    ($start:path, $exit:path) => {
        #[no_mangle]
        pub extern "C" fn im_module_abi_version() -> u32 {
            $crate::module::MODULE_ABI_VERSION
        }

        #[no_mangle]
        pub fn im_module_start(
            blob: $crate::module::HandoffBlob,
            args: &mut $crate::module::ModuleArgs,
        ) -> ::std::result::Result<(), $crate::module::ModuleError> {
            $start(blob, args)
        }

        #[no_mangle]
        pub fn im_module_exit() -> $crate::module::HandoffBlob {
            $exit()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct State {
        counter: u32,
    }

    fn args(abi_version: u32, generation: u64) -> ModuleArgs {
        ModuleArgs {
            abi_version,
            role: ProcessRole::Server,
            ipc_socket: PathBuf::from("/tmp/im.sock"),
            generation,
            mux: Multiplexer::new(),
        }
    }

    #[test]
    fn test_validate_rejects_wrong_abi() {
        let err = args(MODULE_ABI_VERSION + 1, 1).validate().unwrap_err();
        assert!(matches!(err, ModuleError::AbiMismatch { .. }));
        assert!(args(MODULE_ABI_VERSION, 0).validate().is_err());
        assert!(args(MODULE_ABI_VERSION, 1).validate().is_ok());
    }

    #[test]
    fn test_blob_json_state() {
        let blob = HandoffBlob::encode_json(&State { counter: 3 });
        assert_eq!(blob.decode_json::<State>().unwrap(), Some(State { counter: 3 }));
        assert_eq!(HandoffBlob::empty().decode_json::<State>().unwrap(), None);
        assert!(HandoffBlob::new(b"{".to_vec()).decode_json::<State>().is_err());
    }

    #[test]
    fn test_symbol_names_are_nul_terminated() {
        for sym in [ABI_VERSION_SYMBOL, START_SYMBOL, EXIT_SYMBOL] {
            assert_eq!(sym.last(), Some(&0));
        }
    }
}
