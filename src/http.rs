//! Externally reachable HTTP listener.
//!
//! The listener is bound once per process. Every request is routed against
//! the active module's HTTP table at the time it arrives, so a reload swaps
//! handlers without touching the socket.
//!
//! User instances only answer requests carrying their secret in
//! [`USER_SECRET_HEADER`]; everything else gets 401.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::mode::UserSecret;
use crate::module::ActiveHandle;
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::{log_security_event, SecurityEvent};

/// Header the server's router uses to present a user instance's secret.
pub const USER_SECRET_HEADER: &str = "x-im-user-secret";

/// A request handed to a module's HTTP route.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// A module's answer to an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/plain; charset=utf-8"),
            body: body.into().into_bytes(),
        }
    }

    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: Some("application/json"),
                body,
            },
            Err(e) => Self::text(StatusCode::INTERNAL_SERVER_ERROR, format!("encoding failed: {}", e)),
        }
    }

    pub fn not_found() -> Self {
        Self::text(StatusCode::NOT_FOUND, "not found")
    }
}

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        if let Some(content_type) = self.content_type {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        response
    }
}

#[derive(Clone)]
struct HttpState {
    active: ActiveHandle,
    shutdown: Arc<ShutdownCoordinator>,
    secret: Option<Arc<UserSecret>>,
}

/// Router with a single fallback that forwards to the active module.
///
/// With `secret` set, requests must present it in [`USER_SECRET_HEADER`].
pub fn router(
    active: ActiveHandle,
    shutdown: Arc<ShutdownCoordinator>,
    secret: Option<UserSecret>,
) -> Router {
    Router::new().fallback(dispatch).with_state(HttpState {
        active,
        shutdown,
        secret: secret.map(Arc::new),
    })
}

fn secret_presented(expected: &UserSecret, headers: &HeaderMap) -> bool {
    headers
        .get(USER_SECRET_HEADER)
        .map(|value| expected.matches(value.as_bytes()))
        .unwrap_or(false)
}

async fn dispatch(
    State(state): State<HttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    if let Some(secret) = &state.secret {
        if !secret_presented(secret, &headers) {
            let reason = if headers.contains_key(USER_SECRET_HEADER) {
                "secret mismatch"
            } else {
                "secret missing"
            };
            log_security_event(
                SecurityEvent::SecretRejected,
                "HTTP request refused",
                &[("path", uri.path()), ("reason", reason)],
            );
            return HttpResponse::text(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let Some(_in_flight) = state.shutdown.track() else {
        return HttpResponse::text(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    };

    let request = HttpRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
    };

    let snapshot = state.active.load();
    snapshot.mux().dispatch_http(request).await
}

/// Bind the HTTP listener.
pub async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Serve `listener` until shutdown is triggered.
pub fn spawn_http(
    listener: TcpListener,
    active: ActiveHandle,
    shutdown: Arc<ShutdownCoordinator>,
    secret: Option<UserSecret>,
) -> JoinHandle<io::Result<()>> {
    let token = shutdown.token();
    let app = router(active, shutdown, secret);
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "HTTP listener ready");
        }
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    })
}
