//! Module lifecycle: loading, starting and hot-replacing the request
//! handling implementation.

mod abi;
pub mod builtin;
pub mod default;
mod dylib;
mod loader;
mod manager;

pub use abi::{
    ExitFn, HandoffBlob, ModuleArgs, ModuleError, RawAbiVersionFn, RawExitFn, RawStartFn, StartFn,
    ABI_VERSION_SYMBOL, EXIT_SYMBOL, MODULE_ABI_VERSION, START_SYMBOL,
};
pub use dylib::{DylibLoader, DylibLoaderConfig, DynamicLibrary};
pub use loader::{LoadError, LoadedModule, ModuleLoader, StaticLoader};
pub use manager::{
    spawn_reload_task, ActiveHandle, ActiveModule, ModuleContext, ModuleManager, ModuleState,
    ReloadError, ReloadReport, ReloadReceiver, ReloadRequest, ReloadTrigger,
};
