//! Route tables for one module generation.
//!
//! A multiplexer holds every IPC operation and HTTP route the active module
//! registered, plus the core built-ins. It is built once per generation and
//! never mutated after it is published.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use http::{Method, StatusCode};
use serde_json::Value;
use thiserror::Error;

use super::credentials::Credential;
use super::protocol::{RequestFrame, ResponseFrame};
use crate::http::{HttpRequest, HttpResponse};

/// Type-erased IPC handler.
pub type IpcRouteFn =
    Arc<dyn Fn(Option<Credential>, Option<Value>) -> BoxFuture<'static, ResponseFrame> + Send + Sync>;

/// Type-erased HTTP handler.
pub type HttpRouteFn = Arc<dyn Fn(HttpRequest) -> BoxFuture<'static, HttpResponse> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("operation already registered: {0}")]
    DuplicateCall(String),

    #[error("HTTP route already registered: {method} {path}")]
    DuplicateRoute { method: String, path: String },

    #[error("invalid route name: {0:?}")]
    InvalidName(String),
}

#[derive(Default)]
pub struct Multiplexer {
    calls: HashMap<String, IpcRouteFn>,
    routes: HashMap<(Method, String), HttpRouteFn>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw IPC handler. Most code goes through `Call::handler`.
    pub fn register_ipc(&mut self, name: &str, route: IpcRouteFn) -> Result<(), MuxError> {
        if name.trim().is_empty() || name.chars().any(char::is_whitespace) {
            return Err(MuxError::InvalidName(name.to_string()));
        }
        if self.calls.contains_key(name) {
            return Err(MuxError::DuplicateCall(name.to_string()));
        }
        self.calls.insert(name.to_string(), route);
        Ok(())
    }

    /// Register an HTTP handler for an exact method and path.
    pub fn register_http<F, Fut>(&mut self, method: Method, path: &str, handler: F) -> Result<(), MuxError>
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HttpResponse> + Send + 'static,
    {
        if !path.starts_with('/') {
            return Err(MuxError::InvalidName(path.to_string()));
        }
        let key = (method, path.to_string());
        if self.routes.contains_key(&key) {
            return Err(MuxError::DuplicateRoute {
                method: key.0.to_string(),
                path: key.1,
            });
        }
        let handler = Arc::new(handler);
        let route: HttpRouteFn = Arc::new(move |req| {
            let handler = handler.clone();
            Box::pin(async move { handler(req).await })
        });
        self.routes.insert(key, route);
        Ok(())
    }

    pub fn has_call(&self, name: &str) -> bool {
        self.calls.contains_key(name)
    }

    /// Registered operation names, sorted.
    pub fn call_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.calls.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn http_route_count(&self) -> usize {
        self.routes.len()
    }

    /// Route one IPC request. Unknown operations get 404.
    pub async fn dispatch(&self, credential: Option<Credential>, frame: RequestFrame) -> ResponseFrame {
        match self.calls.get(&frame.call) {
            Some(route) => route(credential, frame.body).await,
            None => {
                tracing::debug!(call = %frame.call, "unknown IPC operation");
                ResponseFrame::error(
                    StatusCode::NOT_FOUND,
                    format!("unknown operation: {}", frame.call),
                )
            }
        }
    }

    /// Route one HTTP request. Unknown routes get 404.
    pub async fn dispatch_http(&self, req: HttpRequest) -> HttpResponse {
        let key = (req.method.clone(), req.path.clone());
        match self.routes.get(&key) {
            Some(route) => route(req).await,
            None => HttpResponse::not_found(),
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("calls", &self.call_names())
            .field("http_routes", &self.routes.len())
            .finish()
    }
}
