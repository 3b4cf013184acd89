//! Typed operations shared by the serving and the calling side.
//!
//! ```
//! use im_core::ipc::{Call, Empty};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Quota { bytes: u64 }
//!
//! static QUOTA: Call<Empty, Quota> = Call::define("storage.quota");
//! assert_eq!(QUOTA.name(), "storage.quota");
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::client::{IpcClient, IpcError};
use super::mux::{IpcRouteFn, MuxError, Multiplexer};
use super::protocol::{IpcRequest, IpcResponse, ResponseFrame};
use crate::telemetry::{log_security_event, SecurityEvent};

/// A named operation with fixed request and response types.
pub struct Call<Req, Resp> {
    name: &'static str,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Call<Req, Resp> {
    pub const fn define(name: &'static str) -> Self {
        Self {
            name,
            _types: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<Req, Resp> Clone for Call<Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp> Copy for Call<Req, Resp> {}

impl<Req, Resp> std::fmt::Debug for Call<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Call").field(&self.name).finish()
    }
}

impl<Req, Resp> Call<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    /// Register `handler` for this operation on `mux`.
    ///
    /// Calls without a peer credential are refused with 403, and bodies that
    /// do not decode into `Req` with 400, before `handler` runs.
    pub fn handler<F, Fut>(&self, mux: &mut Multiplexer, handler: F) -> Result<(), MuxError>
    where
        F: Fn(IpcRequest<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IpcResponse<Resp>> + Send + 'static,
    {
        let name = self.name;
        let handler = Arc::new(handler);
        let route: IpcRouteFn = Arc::new(move |credential, body| {
            let handler = handler.clone();
            Box::pin(async move {
                let Some(credential) = credential else {
                    log_security_event(
                        SecurityEvent::ForbiddenCall,
                        "call without verified peer credential",
                        &[("call", name)],
                    );
                    return ResponseFrame::error(StatusCode::FORBIDDEN, "peer credential required");
                };

                let payload = match decode_body::<Req>(body) {
                    Ok(payload) => payload,
                    Err(reason) => {
                        let uid = credential.uid().to_string();
                        log_security_event(
                            SecurityEvent::MalformedRequest,
                            "request body rejected",
                            &[("call", name), ("uid", &uid), ("reason", &reason)],
                        );
                        return ResponseFrame::error(StatusCode::BAD_REQUEST, reason);
                    }
                };

                let request = IpcRequest {
                    operation: name,
                    uid: credential.uid(),
                    payload,
                };
                handler(request).await.into_frame()
            })
        });
        mux.register_ipc(name, route)
    }
}

impl<Req, Resp> Call<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    /// Invoke this operation through `client`.
    pub async fn invoke(&self, client: &IpcClient, payload: &Req) -> Result<Resp, IpcError> {
        let body = serde_json::to_value(payload).map_err(|e| IpcError::Encode(e.to_string()))?;
        let response = client.call_raw(self.name, body).await?;

        if !response.is_success() {
            return Err(IpcError::Remote {
                status: response.status,
                message: response.error_message().unwrap_or_default().to_string(),
            });
        }

        let body = response.body.unwrap_or(Value::Null);
        serde_json::from_value(body).map_err(|e| {
            IpcError::MalformedResponse(format!("{} response did not decode: {}", self.name, e))
        })
    }
}

/// An absent body decodes as JSON `null`, so `()` and `Option<_>` requests
/// may omit it.
fn decode_body<Req: DeserializeOwned>(body: Option<Value>) -> Result<Req, String> {
    match body {
        None | Some(Value::Null) => {
            serde_json::from_value(Value::Null).map_err(|_| "missing request body".to_string())
        }
        Some(value) => serde_json::from_value(value).map_err(|e| format!("invalid request body: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Credential, Empty, RequestFrame};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    static ECHO: Call<Echo, Echo> = Call::define("test.echo");
    static UID: Call<Empty, u32> = Call::define("test.uid");

    fn frame(call: &str, body: Option<Value>) -> RequestFrame {
        RequestFrame {
            call: call.to_string(),
            body,
        }
    }

    #[tokio::test]
    async fn test_missing_credential_is_forbidden() {
        let mut mux = Multiplexer::new();
        UID.handler(&mut mux, |req| async move { IpcResponse::ok(req.uid) })
            .unwrap();
        let resp = mux.dispatch(None, frame("test.uid", Some(json!({})))).await;
        assert_eq!(resp.status, 403);
    }

    #[tokio::test]
    async fn test_malformed_body_never_reaches_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mux = Multiplexer::new();
        let counter = calls.clone();
        ECHO.handler(&mut mux, move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { IpcResponse::ok(req.payload) }
        })
        .unwrap();

        let cred = Some(Credential::current_process());
        for body in [None, Some(Value::Null), Some(json!({"txt": 1})), Some(json!([1, 2]))] {
            let resp = mux.dispatch(cred, frame("test.echo", body)).await;
            assert_eq!(resp.status, 400);
            assert!(resp.error_message().is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let ok = mux
            .dispatch(cred, frame("test.echo", Some(json!({"text": "hi"}))))
            .await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body, Some(json!({"text": "hi"})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_null_tolerant_requests_accept_missing_body() {
        static UNIT: Call<(), u32> = Call::define("test.unit");
        static MAYBE: Call<Option<u32>, u32> = Call::define("test.maybe");

        let mut mux = Multiplexer::new();
        UNIT.handler(&mut mux, |_| async { IpcResponse::ok(1) }).unwrap();
        UID.handler(&mut mux, |req| async move { IpcResponse::ok(req.uid) })
            .unwrap();
        MAYBE
            .handler(&mut mux, |req| async move { IpcResponse::ok(req.payload.unwrap_or(0)) })
            .unwrap();

        let cred = Some(Credential::current_process());
        let unit = mux.dispatch(cred, frame("test.unit", None)).await;
        assert_eq!(unit.status, 200);
        assert_eq!(unit.body, Some(json!(1)));

        let none = mux.dispatch(cred, frame("test.maybe", None)).await;
        assert_eq!(none.status, 200);
        assert_eq!(none.body, Some(json!(0)));

        let some = mux.dispatch(cred, frame("test.maybe", Some(json!(9)))).await;
        assert_eq!(some.body, Some(json!(9)));

        // Struct requests still need a body.
        let empty = mux.dispatch(cred, frame("test.uid", None)).await;
        assert_eq!(empty.status, 400);
        assert_eq!(empty.error_message(), Some("missing request body"));
    }

    #[tokio::test]
    async fn test_uid_comes_from_credential() {
        let mut mux = Multiplexer::new();
        UID.handler(&mut mux, |req| async move { IpcResponse::ok(req.uid) })
            .unwrap();
        let cred = Credential::new(4242, 100, None);
        let resp = mux
            .dispatch(Some(cred), frame("test.uid", Some(json!({"uid": 0}))))
            .await;
        assert_eq!(resp.body, Some(json!(4242)));
    }

    #[tokio::test]
    async fn test_handler_error_lands_in_metadata() {
        let mut mux = Multiplexer::new();
        UID.handler(&mut mux, |_| async {
            IpcResponse::error(StatusCode::CONFLICT, "already running")
        })
        .unwrap();
        let resp = mux
            .dispatch(Some(Credential::current_process()), frame("test.uid", Some(json!({}))))
            .await;
        assert_eq!(resp.status, 409);
        assert_eq!(resp.error_message(), Some("already running"));
        assert!(resp.body.is_none());
    }

    #[test]
    fn test_registering_twice_fails() {
        let mut mux = Multiplexer::new();
        UID.handler(&mut mux, |req| async move { IpcResponse::ok(req.uid) })
            .unwrap();
        let err = UID
            .handler(&mut mux, |req| async move { IpcResponse::ok(req.uid) })
            .unwrap_err();
        assert_eq!(err, MuxError::DuplicateCall("test.uid".into()));
    }
}
