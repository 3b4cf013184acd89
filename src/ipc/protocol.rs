//! Wire format for IPC messages.
//!
//! A request frame names the operation and carries a JSON body. A response
//! frame carries an HTTP-style status, string metadata and an optional body.
//!
//! # Security
//! - Request frames have no identity fields; the caller's uid is attached
//!   server-side from the connection credential
//! - Error text travels in metadata, never in the body

use std::collections::BTreeMap;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Metadata key carrying a failed call's error message.
pub const ERROR_METADATA_KEY: &str = "im-error";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Request as sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub call: String,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Response as sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl ResponseFrame {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            metadata: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(ERROR_METADATA_KEY.to_string(), message.into());
        Self {
            status: status.as_u16(),
            metadata,
            body: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get(ERROR_METADATA_KEY).map(String::as_str)
    }
}

/// Placeholder payload for operations without input or output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// A typed request as seen by a handler.
#[derive(Debug, Clone)]
pub struct IpcRequest<Req> {
    pub operation: &'static str,
    /// Caller uid, always taken from the connection credential.
    pub uid: u32,
    pub payload: Req,
}

/// A typed response produced by a handler.
#[derive(Debug, Clone)]
pub struct IpcResponse<Resp> {
    pub status: StatusCode,
    pub error_message: Option<String>,
    pub payload: Option<Resp>,
}

impl<Resp> IpcResponse<Resp> {
    pub fn ok(payload: Resp) -> Self {
        Self {
            status: StatusCode::OK,
            error_message: None,
            payload: Some(payload),
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: Some(message.into()),
            payload: None,
        }
    }
}

impl<Resp: Serialize> IpcResponse<Resp> {
    /// Lower to the wire representation.
    pub fn into_frame(self) -> ResponseFrame {
        let body = match self.payload.map(serde_json::to_value).transpose() {
            Ok(body) => body,
            Err(e) => {
                return ResponseFrame::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("response encoding failed: {}", e),
                )
            }
        };

        let mut metadata = BTreeMap::new();
        if let Some(message) = self.error_message.filter(|m| !m.is_empty()) {
            metadata.insert(ERROR_METADATA_KEY.to_string(), message);
        }

        ResponseFrame {
            status: self.status.as_u16(),
            metadata,
            body,
        }
    }
}

pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(frame)?)
}

/// Decode a request frame. Empty operation names are rejected.
pub fn decode_request(bytes: &[u8]) -> Result<RequestFrame, ProtocolError> {
    let frame: RequestFrame = serde_json::from_slice(bytes)?;
    if frame.call.trim().is_empty() {
        return Err(ProtocolError::InvalidFormat("empty call name".into()));
    }
    Ok(frame)
}

pub fn encode_response(frame: &ResponseFrame) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(frame)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseFrame, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}
