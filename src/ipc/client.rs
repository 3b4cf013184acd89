//! IPC client.
//!
//! A socket client dials the server path fresh for every call and relies on
//! the kernel to attest its identity; it never sends or reads a uid. The
//! embedded client is used by the server role to call its own active module
//! without a socket round trip.

use std::io;
use std::path::{Path, PathBuf};

use http::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::net::UnixStream;

use super::credentials::Credential;
use super::frame::{read_frame, write_frame, FrameError};
use super::protocol::{decode_response, encode_request, RequestFrame, ResponseFrame};
use crate::module::ActiveHandle;

/// Default frame limit for client connections.
pub const DEFAULT_CLIENT_FRAME_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IPC service at {} is unreachable, the service may not be running: {source}", .path.display())]
    Unreachable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("remote call failed ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request encoding failed: {0}")]
    Encode(String),
}

impl IpcError {
    /// HTTP-style status for surfacing this error to a caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unreachable { .. } | Self::MalformedResponse(_) => StatusCode::BAD_GATEWAY.as_u16(),
            Self::Remote { status, .. } => *status,
            Self::Encode(_) => StatusCode::BAD_REQUEST.as_u16(),
        }
    }

    /// True when the server could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

#[derive(Clone)]
enum Transport {
    Socket { path: PathBuf, max_frame: usize },
    Embedded(ActiveHandle),
}

/// Client for the IPC server.
#[derive(Clone)]
pub struct IpcClient {
    transport: Transport,
}

impl IpcClient {
    /// Client for the server socket at `path`. No connection is made yet.
    pub fn connect(path: impl Into<PathBuf>) -> Self {
        Self {
            transport: Transport::Socket {
                path: path.into(),
                max_frame: DEFAULT_CLIENT_FRAME_LIMIT,
            },
        }
    }

    /// In-process client that dispatches against the active module.
    pub fn embedded(active: ActiveHandle) -> Self {
        Self {
            transport: Transport::Embedded(active),
        }
    }

    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        if let Transport::Socket { max_frame, .. } = &mut self.transport {
            *max_frame = limit;
        }
        self
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.transport, Transport::Embedded(_))
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match &self.transport {
            Transport::Socket { path, .. } => Some(path),
            Transport::Embedded(_) => None,
        }
    }

    /// Send one untyped call and return the raw response frame.
    pub async fn call_raw(&self, call: &str, body: Value) -> Result<ResponseFrame, IpcError> {
        let frame = RequestFrame {
            call: call.to_string(),
            body: Some(body),
        };

        match &self.transport {
            Transport::Embedded(active) => {
                let snapshot = active.load();
                Ok(snapshot
                    .mux()
                    .dispatch(Some(Credential::current_process()), frame)
                    .await)
            }
            Transport::Socket { path, max_frame } => {
                let bytes = encode_request(&frame).map_err(|e| IpcError::Encode(e.to_string()))?;
                round_trip(path, &bytes, *max_frame).await
            }
        }
    }
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.transport {
            Transport::Socket { path, .. } => f.debug_struct("IpcClient").field("path", path).finish(),
            Transport::Embedded(_) => f.debug_struct("IpcClient").field("embedded", &true).finish(),
        }
    }
}

async fn round_trip(path: &Path, request: &[u8], max_frame: usize) -> Result<ResponseFrame, IpcError> {
    let unreachable = |source: io::Error| IpcError::Unreachable {
        path: path.to_path_buf(),
        source,
    };

    let mut stream = UnixStream::connect(path).await.map_err(unreachable)?;

    write_frame(&mut stream, request, max_frame)
        .await
        .map_err(|e| match e {
            FrameError::Io(source) => unreachable(source),
            FrameError::TooLarge { size, max } => {
                IpcError::Encode(format!("request of {} bytes exceeds limit of {}", size, max))
            }
        })?;

    let bytes = match read_frame(&mut stream, max_frame).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return Err(unreachable(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            )))
        }
        Err(FrameError::Io(source)) => return Err(unreachable(source)),
        Err(FrameError::TooLarge { size, max }) => {
            return Err(IpcError::MalformedResponse(format!(
                "response of {} bytes exceeds limit of {}",
                size, max
            )))
        }
    };

    decode_response(&bytes).map_err(|e| IpcError::MalformedResponse(e.to_string()))
}
