//! Integration tests for the IPC server loop.
//!
//! Tests framing, identity attestation, request validation, connection
//! limits and shutdown over real Unix sockets.

mod common;

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use im_core::ipc::frame::read_frame;
use im_core::ipc::{
    AcceptWithCredential, ConnectionConfig, Credential, CredentialError, CredentialedStream, Empty,
    IpcClient, IpcServer, IpcServerConfig, ServerError,
};
use im_core::mode::ProcessRole;
use im_core::module::default::WHOAMI;
use im_core::module::{ModuleContext, ModuleManager, ReloadTrigger, StaticLoader};
use im_core::shutdown::ShutdownCoordinator;

use common::{current_uid, raw_call, start_server, start_server_with, ModuleLog, ScriptedLoader, Step};

#[tokio::test]
async fn test_whoami_reports_kernel_uid() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let client = IpcClient::connect(&server.socket);

    let who = WHOAMI.invoke(&client, &Empty {}).await.unwrap();
    assert_eq!(who.uid, current_uid());
}

#[tokio::test]
async fn test_whoami_ignores_uid_claimed_in_payload() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let mut stream = UnixStream::connect(&server.socket).await.unwrap();

    let forged = current_uid().wrapping_add(1);
    let resp = raw_call(
        &mut stream,
        "connection.whoami",
        Some(json!({ "uid": forged, "user": "root" })),
    )
    .await;

    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, Some(json!({ "uid": current_uid() })));
}

#[tokio::test]
async fn test_malformed_body_rejected_before_handler() {
    let log = Arc::new(ModuleLog::default());
    let loader = ScriptedLoader::new(vec![Step::Load("v1")], log.clone());
    let server = start_server(Box::new(loader)).await;
    let mut stream = UnixStream::connect(&server.socket).await.unwrap();

    for body in [None, Some(json!(null)), Some(json!("text")), Some(json!([1, 2, 3]))] {
        let resp = raw_call(&mut stream, "test.stamp", body).await;
        assert_eq!(resp.status, 400);
        assert!(resp.error_message().is_some());
        assert!(resp.body.is_none());
    }
    assert_eq!(log.handled(), 0);

    let resp = raw_call(&mut stream, "test.stamp", Some(json!({}))).await;
    assert_eq!(resp.status, 200);
    assert_eq!(log.handled(), 1);
}

#[tokio::test]
async fn test_undecodable_frame_gets_400_and_connection_survives() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let mut stream = UnixStream::connect(&server.socket).await.unwrap();

    let garbage = b"this is not json";
    stream
        .write_all(&(garbage.len() as u32).to_le_bytes())
        .await
        .unwrap();
    stream.write_all(garbage).await.unwrap();
    let reply = read_frame(&mut stream, common::FRAME_LIMIT).await.unwrap().unwrap();
    let resp = im_core::ipc::protocol::decode_response(&reply).unwrap();
    assert_eq!(resp.status, 400);

    let resp = raw_call(&mut stream, "im.ping", Some(json!({}))).await;
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn test_unknown_operation_is_404() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let mut stream = UnixStream::connect(&server.socket).await.unwrap();

    let resp = raw_call(&mut stream, "files.delete_everything", Some(json!({}))).await;
    assert_eq!(resp.status, 404);
}

#[tokio::test]
async fn test_oversized_frame_rejected_and_closed() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let mut stream = UnixStream::connect(&server.socket).await.unwrap();

    let declared = (common::FRAME_LIMIT as u32) + 1;
    stream.write_all(&declared.to_le_bytes()).await.unwrap();

    let reply = read_frame(&mut stream, common::FRAME_LIMIT).await.unwrap().unwrap();
    let resp = im_core::ipc::protocol::decode_response(&reply).unwrap();
    assert_eq!(resp.status, 413);

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "connection should be closed after an oversized frame");
}

#[tokio::test]
async fn test_requests_on_one_connection_are_ordered() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let mut stream = UnixStream::connect(&server.socket).await.unwrap();

    for _ in 0..10 {
        let ping = raw_call(&mut stream, "im.ping", Some(json!({}))).await;
        assert_eq!(ping.body, Some(json!({ "generation": 1 })));
        let who = raw_call(&mut stream, "connection.whoami", Some(json!({}))).await;
        assert_eq!(who.body, Some(json!({ "uid": current_uid() })));
    }
}

#[tokio::test]
async fn test_socket_is_world_connectable() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let mode = std::fs::metadata(&server.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o666);
}

#[tokio::test]
async fn test_connection_limit_closes_excess_connections() {
    let server = start_server_with(
        Box::new(StaticLoader::default_module()),
        ConnectionConfig { max_connections: 1 },
    )
    .await;

    let mut first = UnixStream::connect(&server.socket).await.unwrap();
    let resp = raw_call(&mut first, "im.ping", Some(json!({}))).await;
    assert_eq!(resp.status, 200);

    let mut second = UnixStream::connect(&server.socket).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "excess connection should be closed");

    drop(first);
    let client = IpcClient::connect(&server.socket);
    let mut ok = false;
    for _ in 0..50 {
        if WHOAMI.invoke(&client, &Empty {}).await.is_ok() {
            ok = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ok, "slot should be released when the first connection closes");
}

async fn default_manager(socket: &Path) -> Arc<ModuleManager> {
    let (trigger, _rx) = ReloadTrigger::channel(1);
    ModuleManager::start(
        Box::new(StaticLoader::default_module()),
        ModuleContext::new(ProcessRole::Server, socket),
        trigger,
    )
    .await
    .unwrap()
}

fn start_at(socket: &Path, manager: &ModuleManager) -> Result<IpcServer, ServerError> {
    IpcServer::start(
        socket,
        manager.active(),
        Default::default(),
        Default::default(),
        Arc::new(ShutdownCoordinator::new()),
    )
}

#[tokio::test]
async fn test_bind_fails_when_directory_missing() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-dir").join("im.sock");

    let manager = default_manager(&missing).await;
    let result = start_at(&missing, &manager);
    assert!(matches!(result, Err(ServerError::Bind { .. })));
}

#[tokio::test]
async fn test_second_server_on_live_socket_is_refused() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let manager = default_manager(&server.socket).await;

    let err = match start_at(&server.socket, &manager) {
        Ok(_) => panic!("second server bound a live socket"),
        Err(e) => e,
    };
    match err {
        ServerError::Bind { source, .. } => assert_eq!(source.kind(), io::ErrorKind::AddrInUse),
        other => panic!("expected a bind error, got {}", other),
    }

    let mut stream = UnixStream::connect(&server.socket).await.unwrap();
    let resp = raw_call(&mut stream, "im.ping", Some(json!({}))).await;
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("im.sock");
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let manager = default_manager(&socket).await;
    let _task = start_at(&socket, &manager).unwrap().spawn();

    let mut stream = UnixStream::connect(&socket).await.unwrap();
    let resp = raw_call(&mut stream, "im.ping", Some(json!({}))).await;
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn test_shutdown_leaves_a_replacement_socket_alone() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    std::fs::remove_file(&server.socket).unwrap();
    let _successor = std::os::unix::net::UnixListener::bind(&server.socket).unwrap();

    server.shutdown.trigger("test");
    tokio::time::timeout(Duration::from_secs(5), server.server)
        .await
        .expect("accept loop did not stop")
        .unwrap();

    assert!(server.socket.exists(), "successor's socket was unlinked");
}

/// Hands out whatever the test queues, then waits forever.
struct QueuedAcceptor {
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<CredentialedStream, CredentialError>>>,
}

#[async_trait]
impl AcceptWithCredential for QueuedAcceptor {
    async fn accept_with_credential(&self) -> Result<CredentialedStream, CredentialError> {
        match self.queue.lock().await.recv().await {
            Some(next) => next,
            None => std::future::pending().await,
        }
    }
}

#[tokio::test]
async fn test_accept_errors_do_not_stop_the_server() {
    let manager = default_manager(Path::new("/unused/im.sock")).await;
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let (tx, rx) = mpsc::unbounded_channel();

    let server = IpcServer::with_acceptor(
        QueuedAcceptor {
            queue: tokio::sync::Mutex::new(rx),
        },
        manager.active(),
        IpcServerConfig {
            max_frame_size: common::FRAME_LIMIT,
        },
        ConnectionConfig::default(),
        shutdown.clone(),
    );
    assert!(server.socket_path().is_none());
    let task = server.spawn();

    tx.send(Err(CredentialError::PeerCred(io::Error::other("no peer credential"))))
        .unwrap();
    tx.send(Err(CredentialError::Accept(io::Error::other("too many open files"))))
        .unwrap();
    let (served, mut client) = UnixStream::pair().unwrap();
    tx.send(Ok(CredentialedStream {
        stream: served,
        credential: Credential::current_process(),
    }))
    .unwrap();

    let resp = raw_call(&mut client, "connection.whoami", Some(json!({}))).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, Some(json!({ "uid": current_uid() })));

    shutdown.trigger("test");
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("accept loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_accepting_and_removes_socket() {
    let server = start_server(Box::new(StaticLoader::default_module())).await;
    let mut idle = UnixStream::connect(&server.socket).await.unwrap();
    let resp = raw_call(&mut idle, "im.ping", Some(json!({}))).await;
    assert_eq!(resp.status, 200);

    server.shutdown.trigger("test");
    tokio::time::timeout(Duration::from_secs(5), server.server)
        .await
        .expect("accept loop did not stop")
        .unwrap();

    assert!(!server.socket.exists());
    assert!(UnixStream::connect(&server.socket).await.is_err());

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), idle.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "idle connections close on shutdown");
}
