//! RPC channel to the host process.
//!
//! Providers use it to obtain resource URIs at build time; sandboxed code uses
//! it (through `__rpc`) to invoke host-defined helper capabilities.

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A single RPC call, addressed by helper name (`<namespace>.<capability>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub helper: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RpcRequest {
    pub fn new(helper: impl Into<String>) -> Self {
        Self {
            helper: helper.into(),
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}

/// Error reported by the host for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// `{ data } | { error }` as answered by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn data(data: impl Into<Value>) -> Self {
        Self {
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(RpcError {
                message: message.into(),
                stack: None,
            }),
        }
    }
}

/// The external RPC channel. `Err` means the transport failed; host-side
/// failures come back as `Ok` with `error` set.
#[async_trait(?Send)]
pub trait RpcInvoker {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse>;
}

/// Adapts an async closure into an [`RpcInvoker`].
pub struct RpcFn<F>(pub F);

#[async_trait(?Send)]
impl<F, Fut> RpcInvoker for RpcFn<F>
where
    F: Fn(RpcRequest) -> Fut + 'static,
    Fut: Future<Output = Result<RpcResponse>> + 'static,
{
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        (self.0)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_payload_is_flattened() {
        let request = RpcRequest::new("site.Menu")
            .with("variables", json!({"depth": 2}))
            .with("forceFetch", false);
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            json!({"helper": "site.Menu", "variables": {"depth": 2}, "forceFetch": false})
        );

        let decoded: RpcRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_response_variants() {
        let ok: RpcResponse = serde_json::from_value(json!({"data": "/static/a.png"})).unwrap();
        assert_eq!(ok.data, Some(json!("/static/a.png")));
        assert!(ok.error.is_none());

        let failed: RpcResponse =
            serde_json::from_value(json!({"error": {"message": "gone", "stack": "at x"}})).unwrap();
        assert!(failed.data.is_none());
        assert_eq!(failed.error.unwrap().stack.as_deref(), Some("at x"));
    }

    #[tokio::test]
    async fn test_closure_invoker() {
        let invoker = RpcFn(|request: RpcRequest| async move {
            Ok::<_, crate::error::Error>(RpcResponse::data(request.helper))
        });
        let response = invoker.call(RpcRequest::new("a.b")).await.unwrap();
        assert_eq!(response.data, Some(json!("a.b")));
    }
}
