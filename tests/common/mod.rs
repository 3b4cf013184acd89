//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use im_core::ipc::frame::{read_frame, write_frame};
use im_core::ipc::protocol::{decode_response, encode_request};
use im_core::ipc::{
    Call, ConnectionConfig, Empty, IpcResponse, IpcServer, IpcServerConfig, RequestFrame,
    ResponseFrame,
};
use im_core::mode::ProcessRole;
use im_core::module::{
    spawn_reload_task, HandoffBlob, LoadedModule, ModuleContext, ModuleError, ModuleLoader,
    ModuleManager, ReloadTrigger,
};
use im_core::shutdown::ShutdownCoordinator;

pub const FRAME_LIMIT: usize = 64 * 1024;

/// Which version served a call, and under which generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub version: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowRequest {
    pub millis: u64,
}

pub static STAMP: Call<Empty, Stamp> = Call::define("test.stamp");
pub static SLOW: Call<SlowRequest, Stamp> = Call::define("test.slow");

/// Observations shared by every instance of a test module.
#[derive(Default)]
pub struct ModuleLog {
    /// (version, blob received by start)
    pub starts: Mutex<Vec<(String, Vec<u8>)>>,
    /// Versions whose exit ran, in order.
    pub exits: Mutex<Vec<String>>,
    /// Handler invocations of `test.stamp`.
    pub handled: AtomicUsize,
}

impl ModuleLog {
    pub fn starts(&self) -> Vec<(String, Vec<u8>)> {
        self.starts.lock().clone()
    }

    pub fn exits(&self) -> Vec<String> {
        self.exits.lock().clone()
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

/// A module answering `test.stamp` and `test.slow` with its version.
///
/// Its exit returns `from-<version>`. With `fail_start` its start errors.
pub fn versioned_module(version: &str, log: Arc<ModuleLog>, fail_start: bool) -> LoadedModule {
    let start_version = version.to_string();
    let exit_version = version.to_string();
    let start_log = log.clone();
    let exit_log = log;

    LoadedModule::compiled_in(
        format!("test-{}", version),
        move |blob: HandoffBlob, args| {
            start_log
                .starts
                .lock()
                .push((start_version.clone(), blob.as_bytes().to_vec()));
            if fail_start {
                return Err(ModuleError::Start(format!("{} refuses to start", start_version)));
            }

            let stamp = Stamp {
                version: start_version.clone(),
                generation: args.generation,
            };
            let handled_log = start_log.clone();
            let s = stamp.clone();
            STAMP.handler(&mut args.mux, move |_| {
                handled_log.handled.fetch_add(1, Ordering::SeqCst);
                let s = s.clone();
                async move { IpcResponse::ok(s) }
            })?;
            SLOW.handler(&mut args.mux, move |req| {
                let s = stamp.clone();
                async move {
                    tokio::time::sleep(std::time::Duration::from_millis(req.payload.millis)).await;
                    IpcResponse::ok(s)
                }
            })?;
            Ok(())
        },
        move || {
            exit_log.exits.lock().push(exit_version.clone());
            HandoffBlob::new(format!("from-{}", exit_version).into_bytes())
        },
    )
}

/// Loader that yields the given outcomes in order, repeating the last one.
pub struct ScriptedLoader {
    steps: Vec<Step>,
    next: AtomicUsize,
    log: Arc<ModuleLog>,
}

#[derive(Clone)]
pub enum Step {
    Load(&'static str),
    FailStart(&'static str),
    FailBuild,
}

impl ScriptedLoader {
    pub fn new(steps: Vec<Step>, log: Arc<ModuleLog>) -> Self {
        Self {
            steps,
            next: AtomicUsize::new(0),
            log,
        }
    }
}

#[async_trait::async_trait]
impl ModuleLoader for ScriptedLoader {
    async fn build_and_load(&self) -> Result<LoadedModule, im_core::module::LoadError> {
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        let step = self.steps[i.min(self.steps.len() - 1)].clone();
        match step {
            Step::Load(v) => Ok(versioned_module(v, self.log.clone(), false)),
            Step::FailStart(v) => Ok(versioned_module(v, self.log.clone(), true)),
            Step::FailBuild => Err(im_core::module::LoadError::Factory("scripted build failure".into())),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// A running IPC server on a socket in a temporary directory.
pub struct TestServer {
    pub dir: TempDir,
    pub socket: PathBuf,
    pub manager: Arc<ModuleManager>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub server: JoinHandle<()>,
    pub reload_task: JoinHandle<()>,
}

pub async fn start_server(loader: Box<dyn ModuleLoader>) -> TestServer {
    start_server_with(loader, ConnectionConfig::default()).await
}

pub async fn start_server_with(loader: Box<dyn ModuleLoader>, connections: ConnectionConfig) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("im.sock");

    let (trigger, receiver) = ReloadTrigger::channel(8);
    let context = ModuleContext::new(ProcessRole::Server, &socket);
    let manager = ModuleManager::start(loader, context, trigger).await.unwrap();
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let reload_task = spawn_reload_task(manager.clone(), receiver, shutdown.token());

    let server = IpcServer::start(
        &socket,
        manager.active(),
        IpcServerConfig {
            max_frame_size: FRAME_LIMIT,
        },
        connections,
        shutdown.clone(),
    )
    .unwrap()
    .spawn();

    TestServer {
        dir,
        socket,
        manager,
        shutdown,
        server,
        reload_task,
    }
}

/// Send one request on an existing connection and read its response.
pub async fn raw_call(stream: &mut UnixStream, call: &str, body: Option<Value>) -> ResponseFrame {
    let frame = RequestFrame {
        call: call.to_string(),
        body,
    };
    let bytes = encode_request(&frame).unwrap();
    write_frame(stream, &bytes, FRAME_LIMIT).await.unwrap();
    let reply = read_frame(stream, FRAME_LIMIT)
        .await
        .unwrap()
        .expect("server closed the connection");
    decode_response(&reply).unwrap()
}

pub fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}
