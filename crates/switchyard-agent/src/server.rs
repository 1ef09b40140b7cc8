//! Serves a [`ModuleHandler`] over JSON-RPC.
//!
//! Same shape as the control plane server: `POST /` for JSON-RPC and
//! `GET /__health` for supervisors.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use switchyard_common::methods::{module, ActiveVersion, CanHandleParams, ModuleTrafficWeightParams, ScaleParams};
use switchyard_common::transport::HttpTransport;
use switchyard_common::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Result, SwitchyardError};

use crate::handler::ModuleHandler;

type Reply = std::result::Result<Value, JsonRpcError>;

fn params<T: DeserializeOwned>(raw: Value) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(raw).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))
}

fn reply<T: Serialize>(result: Result<T>) -> Reply {
    let value = result.map_err(|e| e.to_jsonrpc())?;
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
}

/// Answers one request against `handler`.
pub async fn handle_request(handler: &dyn ModuleHandler, req: JsonRpcRequest) -> JsonRpcResponse {
    debug!(method = %req.method, "module request");
    let result = dispatch(handler, &req.method, req.params).await;
    match result {
        Ok(value) => JsonRpcResponse::success(req.id, value),
        Err(error) => JsonRpcResponse::error(req.id, error),
    }
}

async fn dispatch(handler: &dyn ModuleHandler, method: &str, raw: Value) -> Reply {
    match method {
        module::GET_STATUS => reply(handler.get_status().await),
        module::CAN_HANDLE => {
            let p: CanHandleParams = params(raw)?;
            reply(handler.can_handle(&p.pattern).await)
        }
        module::SCALE => {
            let p: ScaleParams = params(raw)?;
            reply(handler.scale(p.target_replicas).await)
        }
        module::SET_TRAFFIC_WEIGHT => {
            let p: ModuleTrafficWeightParams = params(raw)?;
            handler
                .set_traffic_weight(&p.version, p.weight)
                .await
                .map_err(|e| e.to_jsonrpc())?;
            Ok(json!({ "accepted": true }))
        }
        module::GET_ACTIVE_VERSION => {
            let version = handler.get_active_version().await;
            reply(version.map(|version| ActiveVersion { version }))
        }
        module::ROLLBACK => {
            handler.rollback().await.map_err(|e| e.to_jsonrpc())?;
            Ok(json!({ "accepted": true }))
        }
        module::HEALTH_CHECK => reply(handler.health_check().await),
        module::DEEP_HEALTH_CHECK => reply(handler.deep_health_check().await),
        _ => Err(JsonRpcError::method_not_found()),
    }
}

pub struct AgentServer {
    handler: Arc<dyn ModuleHandler>,
}

impl AgentServer {
    pub fn new(handler: Arc<dyn ModuleHandler>) -> Self {
        Self { handler }
    }

    pub fn app(&self) -> axum::Router {
        axum::Router::new()
            .route("/", post(handle_jsonrpc))
            .route("/__health", get(health))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.handler))
    }

    /// Serves on a bound listener until `shutdown` resolves.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| SwitchyardError::Transport(format!("failed to get local addr: {}", e)))?;
        info!("module agent listening on {}", local);

        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| SwitchyardError::Transport(format!("server error: {}", e)))
    }
}

async fn handle_jsonrpc(State(handler): State<Arc<dyn ModuleHandler>>, body: Bytes) -> Json<JsonRpcResponse> {
    match HttpTransport::parse_jsonrpc(&body) {
        Ok(request) => Json(handle_request(handler.as_ref(), request).await),
        Err(error) => Json(JsonRpcResponse::error(Value::Null, error)),
    }
}

async fn health(State(handler): State<Arc<dyn ModuleHandler>>) -> impl IntoResponse {
    match handler.health_check().await {
        Ok(report) if report.healthy => (StatusCode::OK, "OK"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    }
}
