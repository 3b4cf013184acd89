//! Privilege-separated IPC between the server and per-user instances.
//!
//! The server listens on a Unix socket. Every accepted connection is tagged
//! with the kernel-attested credential of its peer, and handlers only ever
//! see the uid from that credential.

mod call;
mod client;
mod connections;
mod credentials;
pub mod frame;
mod keepalive;
mod mux;
pub mod protocol;
mod server;

pub use call::Call;
pub use client::{IpcClient, IpcError, DEFAULT_CLIENT_FRAME_LIMIT};
pub use connections::{ConnectionConfig, ConnectionPool, ConnectionSlot};
pub use credentials::{
    AcceptWithCredential, Credential, CredentialError, CredentialedStream, PeerCredListener,
};
pub use frame::FrameError;
pub use keepalive::spawn_keep_alive;
pub use mux::{HttpRouteFn, IpcRouteFn, Multiplexer, MuxError};
pub use protocol::{Empty, IpcRequest, IpcResponse, ProtocolError, RequestFrame, ResponseFrame};
pub use server::{IpcServer, IpcServerConfig, ServerError};
