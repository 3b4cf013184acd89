//! IPC server: accept loop and per-connection request handling.
//!
//! One task accepts; one task per connection reads frames in order and
//! dispatches each against a single snapshot of the active module.

use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use super::connections::{ConnectionConfig, ConnectionPool, ConnectionSlot};
use super::credentials::{AcceptWithCredential, Credential, CredentialedStream, PeerCredListener};
use super::frame::{read_frame, write_frame, FrameError};
use super::protocol::{decode_request, encode_response, ResponseFrame};
use crate::module::ActiveHandle;
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::{log_security_event, SecurityEvent};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// IPC server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcServerConfig {
    /// Maximum frame size in either direction.
    pub max_frame_size: usize,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind IPC socket {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to set permissions on {}: {source}", .path.display())]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The socket file a server bound, identified by device and inode.
#[derive(Debug, Clone)]
struct BoundSocket {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl BoundSocket {
    fn record(path: &Path) -> io::Result<Self> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// Unlink the file, unless another server has since replaced it.
    fn remove(&self) {
        match std::fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.dev() == self.dev && meta.ino() == self.ino => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!(socket = %self.path.display(), error = %e, "could not remove socket");
                }
            }
            Ok(_) => tracing::debug!(socket = %self.path.display(), "socket replaced, leaving it"),
            Err(_) => {}
        }
    }
}

/// Serves the active module's operations on a Unix socket.
pub struct IpcServer<A = PeerCredListener> {
    acceptor: A,
    socket: Option<BoundSocket>,
    active: ActiveHandle,
    config: IpcServerConfig,
    connections: Arc<ConnectionPool>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl IpcServer<PeerCredListener> {
    /// Bind the socket at `path` and make it connectable by every local user.
    ///
    /// A stale socket file left by a previous run is removed first. If a
    /// server still answers on `path` this fails with `AddrInUse`. Any
    /// failure should be treated as fatal.
    pub fn start(
        path: impl AsRef<Path>,
        active: ActiveHandle,
        config: IpcServerConfig,
        connections: ConnectionConfig,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Result<Self, ServerError> {
        let path = path.as_ref();
        remove_stale_socket(path)?;

        let listener = PeerCredListener::bind(path).map_err(|source| ServerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        // Access is decided by peer uid, so the file mode is open.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).map_err(|source| {
            ServerError::Permissions {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let bound = BoundSocket::record(path).map_err(|source| ServerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(socket = %path.display(), "IPC server listening");

        let mut server = Self::with_acceptor(listener, active, config, connections, shutdown);
        server.socket = Some(bound);
        Ok(server)
    }
}

impl<A: AcceptWithCredential> IpcServer<A> {
    /// Serve connections produced by an arbitrary acceptor.
    pub fn with_acceptor(
        acceptor: A,
        active: ActiveHandle,
        config: IpcServerConfig,
        connections: ConnectionConfig,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            acceptor,
            socket: None,
            active,
            config,
            connections: Arc::new(ConnectionPool::new(connections)),
            shutdown,
        }
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket.as_ref().map(|s| s.path.as_path())
    }

    pub fn connection_pool(&self) -> Arc<ConnectionPool> {
        self.connections.clone()
    }

    /// Run the accept loop on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }

    /// Accept connections until shutdown is triggered.
    pub async fn serve(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.acceptor.accept_with_credential() => accepted,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) if e.is_listener_error() => {
                    tracing::warn!(error = %e, "IPC accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                // Already logged and closed by the acceptor.
                Err(_) => continue,
            };

            let Some(slot) = self.connections.try_acquire_owned() else {
                let uid = conn.credential.uid().to_string();
                let max = self.connections.max_connections().to_string();
                log_security_event(
                    SecurityEvent::ConnectionLimited,
                    "IPC connection refused at limit",
                    &[("uid", &uid), ("max", &max)],
                );
                drop(conn);
                continue;
            };

            tokio::spawn(handle_connection(
                conn,
                self.active.clone(),
                self.config.max_frame_size,
                self.shutdown.clone(),
                slot,
            ));
        }

        tracing::info!("IPC server stopped accepting");
        if let Some(socket) = &self.socket {
            socket.remove();
        }
    }
}

/// Remove a socket file nobody is listening on.
///
/// Anything that is not a socket, or that cannot be probed, is left for
/// `bind` to report.
fn remove_stale_socket(path: &Path) -> Result<(), ServerError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {}
        _ => return Ok(()),
    }

    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(ServerError::Bind {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "another server is listening"),
        }),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            tracing::info!(socket = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(|source| ServerError::Bind {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(_) => Ok(()),
    }
}

async fn handle_connection(
    conn: CredentialedStream,
    active: ActiveHandle,
    max_frame: usize,
    shutdown: Arc<ShutdownCoordinator>,
    _slot: ConnectionSlot,
) {
    let CredentialedStream { mut stream, credential } = conn;
    log_security_event(
        SecurityEvent::CredentialAccepted,
        "IPC connection accepted",
        &[
            ("uid", &credential.uid().to_string()),
            ("pid", &credential.pid().map(|p| p.to_string()).unwrap_or_default()),
        ],
    );

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = read_frame(&mut stream, max_frame) => read,
        };

        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(FrameError::TooLarge { size, max }) => {
                tracing::warn!(uid = credential.uid(), size, max, "IPC frame over limit");
                let resp = ResponseFrame::error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("frame of {} bytes exceeds limit of {}", size, max),
                );
                let _ = send(&mut stream, &resp, max_frame).await;
                break;
            }
            Err(e) => {
                if !e.is_disconnect() {
                    tracing::debug!(uid = credential.uid(), error = %e, "IPC read failed");
                }
                break;
            }
        };

        let Some(_in_flight) = shutdown.track() else {
            let resp = ResponseFrame::error(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down");
            let _ = send(&mut stream, &resp, max_frame).await;
            break;
        };

        let response = handle_frame(&bytes, credential, &active).await;
        if let Err(e) = send(&mut stream, &response, max_frame).await {
            tracing::debug!(uid = credential.uid(), error = %e, "IPC write failed");
            break;
        }
    }
}

async fn handle_frame(bytes: &[u8], credential: Credential, active: &ActiveHandle) -> ResponseFrame {
    let frame = match decode_request(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            let uid = credential.uid().to_string();
            let reason = e.to_string();
            log_security_event(
                SecurityEvent::MalformedRequest,
                "undecodable IPC frame",
                &[("uid", &uid), ("reason", &reason)],
            );
            return ResponseFrame::error(StatusCode::BAD_REQUEST, format!("invalid request frame: {}", e));
        }
    };

    // One snapshot per request, held until the response is built.
    let snapshot = active.load();
    tracing::debug!(call = %frame.call, uid = credential.uid(), generation = snapshot.generation(), "IPC call");
    snapshot.mux().dispatch(Some(credential), frame).await
}

async fn send(stream: &mut UnixStream, response: &ResponseFrame, max_frame: usize) -> Result<(), FrameError> {
    let bytes = match encode_response(response) {
        Ok(bytes) => bytes,
        Err(e) => encode_fallback(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    if bytes.len() > max_frame {
        let fallback = encode_fallback(StatusCode::INTERNAL_SERVER_ERROR, "response exceeds frame limit");
        return write_frame(stream, &fallback, max_frame).await;
    }
    write_frame(stream, &bytes, max_frame).await
}

fn encode_fallback(status: StatusCode, message: &str) -> Vec<u8> {
    encode_response(&ResponseFrame::error(status, message)).unwrap_or_default()
}
