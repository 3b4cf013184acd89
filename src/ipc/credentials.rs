// Copyright 2024-2026 im-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel-attested peer credentials for accepted IPC connections.
//!
//! # Security
//! - The credential is read from the kernel exactly once, right after accept
//! - Nothing in a request payload can replace it
//! - A connection whose credential cannot be read is closed before any
//!   request is read from it

use std::io;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};

use crate::telemetry::{log_security_event, SecurityEvent};

/// Identity of the process on the other end of an IPC connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    uid: u32,
    gid: u32,
    pid: Option<i32>,
    accepted_at: DateTime<Utc>,
}

impl Credential {
    pub(crate) fn new(uid: u32, gid: u32, pid: Option<i32>) -> Self {
        Self {
            uid,
            gid,
            pid,
            accepted_at: Utc::now(),
        }
    }

    /// Credential of the calling process itself.
    ///
    /// Used by the embedded client, where caller and callee are one process.
    pub fn current_process() -> Self {
        // SAFETY: getuid/getgid/getpid cannot fail and touch no memory.
        let (uid, gid, pid) = unsafe { (libc::getuid(), libc::getgid(), libc::getpid()) };
        Self::new(uid, gid, Some(pid))
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn accepted_at(&self) -> DateTime<Utc> {
        self.accepted_at
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("could not enable credential passing: {0}")]
    PassCred(#[source] io::Error),

    #[error("could not read peer credential: {0}")]
    PeerCred(#[source] io::Error),
}

impl CredentialError {
    /// True when the listener itself failed, rather than one connection.
    pub fn is_listener_error(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// An accepted stream paired with its peer's credential.
#[derive(Debug)]
pub struct CredentialedStream {
    pub stream: UnixStream,
    pub credential: Credential,
}

/// A listener that yields only connections with a known peer identity.
#[async_trait]
pub trait AcceptWithCredential: Send + Sync + 'static {
    /// Accept the next connection and attach its credential.
    ///
    /// On a credential failure the raw stream has already been dropped.
    async fn accept_with_credential(&self) -> Result<CredentialedStream, CredentialError>;
}

/// Unix socket listener that reads `SO_PEERCRED` for every connection.
pub struct PeerCredListener {
    inner: UnixListener,
}

impl PeerCredListener {
    /// Bind a new listener at `path`.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            inner: UnixListener::bind(path)?,
        })
    }

    pub fn from_listener(inner: UnixListener) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AcceptWithCredential for PeerCredListener {
    async fn accept_with_credential(&self) -> Result<CredentialedStream, CredentialError> {
        let (stream, _addr) = self.inner.accept().await.map_err(CredentialError::Accept)?;

        match read_credential(&stream) {
            Ok(credential) => {
                tracing::trace!(uid = credential.uid(), pid = ?credential.pid(), "peer credential read");
                Ok(CredentialedStream { stream, credential })
            }
            Err(err) => {
                let reason = err.to_string();
                log_security_event(
                    SecurityEvent::CredentialUnavailable,
                    "closing connection without peer credential",
                    &[("reason", &reason)],
                );
                drop(stream);
                Err(err)
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn read_credential(stream: &UnixStream) -> Result<Credential, CredentialError> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();

    let enable: libc::c_int = 1;
    // SAFETY: fd is a live socket owned by `stream`; the option value points to
    // a c_int that outlives the call and its size is passed alongside it.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(CredentialError::PassCred(io::Error::last_os_error()));
    }

    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `cred` is a properly sized ucred buffer and `len` holds its size.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(CredentialError::PeerCred(io::Error::last_os_error()));
    }
    if len as usize != std::mem::size_of::<libc::ucred>() {
        return Err(CredentialError::PeerCred(io::Error::new(
            io::ErrorKind::InvalidData,
            "short SO_PEERCRED result",
        )));
    }

    let pid = (cred.pid > 0).then_some(cred.pid);
    Ok(Credential::new(cred.uid, cred.gid, pid))
}

#[cfg(not(target_os = "linux"))]
fn read_credential(stream: &UnixStream) -> Result<Credential, CredentialError> {
    let cred = stream.peer_cred().map_err(CredentialError::PeerCred)?;
    Ok(Credential::new(cred.uid(), cred.gid(), cred.pid()))
}
