//! HTTP Transport for JSON-RPC
//!
//! Client side: [`HttpTransport::call`] POSTs a JSON-RPC request to
//! `http://<address>/` over a pooled hyper client and enforces the caller's
//! deadline. Server side: [`HttpTransport::parse_jsonrpc`] turns a request
//! body into a [`JsonRpcRequest`] or the matching JSON-RPC error.
//!
//! # Example
//!
//! ```no_run
//! use switchyard_common::transport::HttpTransport;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> switchyard_common::Result<()> {
//! let transport = HttpTransport::new();
//! let modules = transport
//!     .call("127.0.0.1:7600", "list_modules", json!({}), Duration::from_secs(2))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::error::{Result, SwitchyardError};
use crate::protocol::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Pooled HTTP/1.1 client type used for every outbound call.
pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// JSON-RPC client over HTTP. Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    client: HttpClient,
    next_id: Arc<AtomicU64>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();
        Self {
            client,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Normalises an address into the endpoint URI.
    ///
    /// `host:port` becomes `http://host:port/`; explicit URLs are kept.
    pub fn endpoint(address: &str) -> String {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        if base.ends_with('/') {
            base
        } else {
            format!("{}/", base)
        }
    }

    /// Sends one JSON-RPC call and waits at most `deadline` for the answer.
    ///
    /// Connection failures map to [`SwitchyardError::Transport`], an expired
    /// deadline to [`SwitchyardError::Timeout`], and JSON-RPC error objects
    /// back to the domain taxonomy.
    pub async fn call(&self, address: &str, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, params, json!(id));
        let body = serde_json::to_vec(&request)?;
        let uri = Self::endpoint(address);

        let http_request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| SwitchyardError::Transport(format!("bad request for {}: {}", uri, e)))?;

        let exchange = async {
            let response = self
                .client
                .request(http_request)
                .await
                .map_err(|e| SwitchyardError::Transport(format!("{} unreachable: {}", uri, e)))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| SwitchyardError::Transport(format!("reading body from {}: {}", uri, e)))?
                .to_bytes();

            if bytes.is_empty() {
                return Err(SwitchyardError::Transport(format!("{} answered HTTP {} with no body", uri, status)));
            }
            let response: JsonRpcResponse = serde_json::from_slice(&bytes).map_err(|e| {
                SwitchyardError::Transport(format!("invalid JSON-RPC response from {}: {}", uri, e))
            })?;
            response.into_result()
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%uri, method, "call exceeded deadline of {:?}", deadline);
                Err(SwitchyardError::Timeout(deadline.as_millis() as u64))
            }
        }
    }

    /// Typed wrapper around [`Self::call`].
    pub async fn call_typed<P, R>(&self, address: &str, method: &str, params: &P, deadline: Duration) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.call(address, method, params, deadline).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Parses a JSON-RPC request from an HTTP body.
    pub fn parse_jsonrpc(body: &[u8]) -> std::result::Result<JsonRpcRequest, JsonRpcError> {
        let value: Value = serde_json::from_slice(body).map_err(|_| JsonRpcError::parse_error())?;
        let request: JsonRpcRequest = serde_json::from_value(value).map_err(|_| JsonRpcError::invalid_request())?;
        if request.jsonrpc != "2.0" {
            return Err(JsonRpcError::invalid_request());
        }
        Ok(request)
    }
}
