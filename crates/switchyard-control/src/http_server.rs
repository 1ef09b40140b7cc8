//! HTTP Server for the control plane
//!
//! - `POST /` takes one JSON-RPC 2.0 request and answers with one response
//! - `GET /__health` is a liveness probe for process supervisors

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json,
};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use switchyard_common::transport::HttpTransport;
use switchyard_common::{JsonRpcResponse, Result, SwitchyardError};

use crate::control_plane::ControlPlane;
use crate::http_router::ControlPlaneRouter;

pub struct HttpServer {
    router: Arc<ControlPlaneRouter>,
}

impl HttpServer {
    pub fn new(control: Arc<ControlPlane>) -> Self {
        Self {
            router: Arc::new(ControlPlaneRouter::new(control)),
        }
    }

    /// The axum app, for embedding or in-process tests.
    pub fn app(&self) -> axum::Router {
        axum::Router::new()
            .route("/", post(handle_jsonrpc))
            .route("/__health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.router))
    }

    /// Binds `addr` and serves until the process exits.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SwitchyardError::Transport(format!("failed to bind to {}: {}", addr, e)))?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| SwitchyardError::Transport(format!("failed to get local addr: {}", e)))?;
        info!("control plane listening on {}", local);

        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| SwitchyardError::Transport(format!("server error: {}", e)))
    }
}

async fn handle_jsonrpc(State(router): State<Arc<ControlPlaneRouter>>, body: Bytes) -> Json<JsonRpcResponse> {
    match HttpTransport::parse_jsonrpc(&body) {
        Ok(request) => Json(router.handle_request(request).await),
        Err(error) => Json(JsonRpcResponse::error(Value::Null, error)),
    }
}

async fn health_check(State(router): State<Arc<ControlPlaneRouter>>) -> impl IntoResponse {
    if router.control().registry().is_running() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "registry stopped")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlPlaneConfig;
    use crate::testing::MockModuleClient;

    async fn server() -> HttpServer {
        let control = ControlPlane::builder(ControlPlaneConfig::default(), Arc::new(MockModuleClient::new()))
            .without_background_tasks()
            .start()
            .await
            .unwrap();
        HttpServer::new(Arc::new(control))
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = server().await;
        let response = health_check(State(Arc::clone(&server.router))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_body_gets_parse_error() {
        let server = server().await;
        let Json(response) = handle_jsonrpc(State(Arc::clone(&server.router)), Bytes::from_static(b"{oops")).await;
        assert_eq!(response.error.map(|e| e.code), Some(-32700));
        assert_eq!(response.id, Value::Null);
    }

    #[tokio::test]
    async fn test_valid_body_is_dispatched() {
        let server = server().await;
        let body = Bytes::from_static(br#"{"jsonrpc":"2.0","method":"get_routing_table","id":7}"#);
        let Json(response) = handle_jsonrpc(State(Arc::clone(&server.router)), body).await;
        assert!(response.error.is_none());
        assert_eq!(response.id, serde_json::json!(7));
    }
}
