//! Control plane -> module instance calls over HTTP JSON-RPC.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use switchyard_common::jsonrpc::METHOD_NOT_FOUND;
use switchyard_common::methods::{module, ActiveVersion, CanHandleParams, ModuleTrafficWeightParams, ScaleParams};
use switchyard_common::transport::HttpTransport;
use switchyard_common::{
    CanHandleResponse, HealthReport, ModuleClient, ModuleStatus, Result, ScaleAck, SwitchyardError, TrafficPattern,
};

/// [`ModuleClient`] that speaks JSON-RPC to `http://<address>/`.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Clone, Default)]
pub struct HttpModuleClient {
    transport: HttpTransport,
}

impl HttpModuleClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ModuleClient for HttpModuleClient {
    async fn get_status(&self, address: &str, deadline: Duration) -> Result<ModuleStatus> {
        self.transport
            .call_typed(address, module::GET_STATUS, &json!({}), deadline)
            .await
    }

    async fn can_handle(
        &self,
        address: &str,
        pattern: &TrafficPattern,
        deadline: Duration,
    ) -> Result<CanHandleResponse> {
        let params = CanHandleParams {
            pattern: pattern.clone(),
        };
        self.transport
            .call_typed(address, module::CAN_HANDLE, &params, deadline)
            .await
    }

    async fn scale(&self, address: &str, target_replicas: u32, deadline: Duration) -> Result<ScaleAck> {
        self.transport
            .call_typed(address, module::SCALE, &ScaleParams { target_replicas }, deadline)
            .await
    }

    async fn set_traffic_weight(
        &self,
        address: &str,
        version: &str,
        weight: u8,
        deadline: Duration,
    ) -> Result<()> {
        let params = ModuleTrafficWeightParams {
            version: version.to_string(),
            weight,
        };
        let _: Value = self
            .transport
            .call_typed(address, module::SET_TRAFFIC_WEIGHT, &params, deadline)
            .await?;
        Ok(())
    }

    async fn get_active_version(&self, address: &str, deadline: Duration) -> Result<String> {
        let active: ActiveVersion = self
            .transport
            .call_typed(address, module::GET_ACTIVE_VERSION, &json!({}), deadline)
            .await?;
        Ok(active.version)
    }

    async fn rollback(&self, address: &str, deadline: Duration) -> Result<()> {
        let _: Value = self
            .transport
            .call_typed(address, module::ROLLBACK, &json!({}), deadline)
            .await?;
        Ok(())
    }

    async fn health_check(&self, address: &str, deadline: Duration) -> Result<HealthReport> {
        self.transport
            .call_typed(address, module::HEALTH_CHECK, &json!({}), deadline)
            .await
    }

    /// Falls back to the shallow check on modules without a deep probe.
    async fn deep_health_check(&self, address: &str, deadline: Duration) -> Result<HealthReport> {
        match self
            .transport
            .call_typed(address, module::DEEP_HEALTH_CHECK, &json!({}), deadline)
            .await
        {
            Err(SwitchyardError::Remote { code, .. }) if code == METHOD_NOT_FOUND => {
                debug!(address, "no deep probe, using health_check");
                self.health_check(address, deadline).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use switchyard_common::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

    async fn answer(Json(req): Json<JsonRpcRequest>) -> Json<JsonRpcResponse> {
        let result = match req.method.as_str() {
            module::CAN_HANDLE => {
                assert_eq!(req.params["pattern"], "tcp:443");
                Ok(json!({ "priority": 70, "load": 0.25 }))
            }
            module::SCALE => Ok(json!({ "accepted": true, "replicas": req.params["target_replicas"] })),
            module::HEALTH_CHECK => Ok(json!({ "healthy": true })),
            module::GET_ACTIVE_VERSION => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({ "version": "v9" }))
            }
            _ => Err(JsonRpcError::method_not_found()),
        };
        Json(match result {
            Ok(value) => JsonRpcResponse::success(req.id, value),
            Err(e) => JsonRpcResponse::error(req.id, e),
        })
    }

    async fn module_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let app = Router::new().route("/", post(answer));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        address
    }

    const DEADLINE: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_can_handle_and_scale() {
        let address = module_server().await;
        let client = HttpModuleClient::new();

        let answer = client
            .can_handle(&address, &"tcp:443".parse().unwrap(), DEADLINE)
            .await
            .unwrap();
        assert_eq!(answer.priority, 70);
        assert_eq!(answer.load, 0.25);

        let ack = client.scale(&address, 4, DEADLINE).await.unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.replicas, 4);
    }

    #[tokio::test]
    async fn test_deep_probe_falls_back_to_shallow() {
        let address = module_server().await;
        let report = HttpModuleClient::new()
            .deep_health_check(&address, DEADLINE)
            .await
            .unwrap();
        assert!(report.healthy);
    }

    #[tokio::test]
    async fn test_deadline_is_enforced() {
        let address = module_server().await;
        let result = HttpModuleClient::new()
            .get_active_version(&address, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(SwitchyardError::Timeout(100))));
    }

    #[tokio::test]
    async fn test_unreachable_module_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = HttpModuleClient::new().health_check(&address, DEADLINE).await;
        assert!(matches!(result, Err(SwitchyardError::Transport(_))));
    }
}
