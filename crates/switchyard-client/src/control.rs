//! Typed client for the control plane's JSON-RPC API.
//!
//! ```no_run
//! use switchyard_client::ControlPlaneClient;
//! use switchyard_common::methods::ModuleFilter;
//!
//! # async fn run() -> switchyard_common::Result<()> {
//! let client = ControlPlaneClient::new("127.0.0.1:7600");
//! for module in client.list_modules(ModuleFilter::default()).await? {
//!     println!("{} {} {:?}", module.instance_id, module.address, module.health_status);
//! }
//! # Ok(())
//! # }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use switchyard_common::methods::{
    control, CheckHealthParams, ControlPlaneHealth, HeartbeatParams, HeartbeatResult, InstanceIdParams, ModuleFilter,
    ModuleTypeParams, PromoteVersionParams, RebalanceResult, RegisterModuleResult, ReportMetricsParams,
    RouteConnectionParams, RoutingDecision, SetScalingPolicyParams, SetTrafficSplitParams, SetTrafficWeightParams,
    TriggerScalingParams, TriggerScalingResult, UpdateRoutingParams, UpdateRoutingResult, ValidateRouteParams,
    ValidateRouteResult,
};
use switchyard_common::transport::HttpTransport;
use switchyard_common::{
    DeploymentInfo, DeploymentState, InstanceId, ModuleInstanceInfo, ModuleType, PromotionStrategy,
    RegisterModuleRequest, Result, Route, RoutingTableView, ScalingPolicy, ScalingStatus, TrafficPattern,
};
use switchyard_metrics::AggregatedMetrics;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ControlPlaneClient {
    address: String,
    transport: HttpTransport,
    timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            transport: HttpTransport::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Untyped call, for methods or params this client does not model.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.transport.call(&self.address, method, params, self.timeout).await
    }

    async fn typed<P: Serialize + ?Sized, R: DeserializeOwned>(&self, method: &str, params: &P) -> Result<R> {
        self.transport
            .call_typed(&self.address, method, params, self.timeout)
            .await
    }

    pub async fn register_module(&self, request: &RegisterModuleRequest) -> Result<RegisterModuleResult> {
        self.typed(control::REGISTER_MODULE, request).await
    }

    pub async fn unregister_module(&self, instance_id: InstanceId) -> Result<ModuleInstanceInfo> {
        self.typed(control::UNREGISTER_MODULE, &InstanceIdParams { instance_id })
            .await
    }

    pub async fn heartbeat(
        &self,
        instance_id: InstanceId,
        load: f64,
        custom_metrics: HashMap<String, f64>,
    ) -> Result<HeartbeatResult> {
        let params = HeartbeatParams {
            instance_id,
            load,
            custom_metrics,
        };
        self.typed(control::HEARTBEAT, &params).await
    }

    pub async fn list_modules(&self, filter: ModuleFilter) -> Result<Vec<ModuleInstanceInfo>> {
        self.typed(control::LIST_MODULES, &filter).await
    }

    pub async fn get_module_info(&self, instance_id: InstanceId) -> Result<ModuleInstanceInfo> {
        self.typed(control::GET_MODULE_INFO, &InstanceIdParams { instance_id })
            .await
    }

    pub async fn update_routing(&self, routes: Vec<Route>) -> Result<UpdateRoutingResult> {
        self.typed(control::UPDATE_ROUTING, &UpdateRoutingParams { routes })
            .await
    }

    pub async fn get_routing_table(&self) -> Result<RoutingTableView> {
        self.typed(control::GET_ROUTING_TABLE, &json!({})).await
    }

    pub async fn validate_route(&self, route: Route) -> Result<ValidateRouteResult> {
        self.typed(control::VALIDATE_ROUTE, &ValidateRouteParams { route })
            .await
    }

    pub async fn report_metrics(&self, instance_id: InstanceId, metrics: HashMap<String, f64>) -> Result<()> {
        let _: Value = self
            .typed(control::REPORT_METRICS, &ReportMetricsParams { instance_id, metrics })
            .await?;
        Ok(())
    }

    pub async fn get_aggregated_metrics(&self, module_type: ModuleType) -> Result<AggregatedMetrics> {
        self.typed(control::GET_AGGREGATED_METRICS, &ModuleTypeParams { module_type })
            .await
    }

    pub async fn check_health(&self, deep: bool) -> Result<ControlPlaneHealth> {
        self.typed(control::CHECK_HEALTH, &CheckHealthParams { deep }).await
    }

    /// Full status document; deserialize into `switchyard_control::ControlPlaneStatus` when typed access is needed.
    pub async fn get_status(&self) -> Result<Value> {
        self.call(control::GET_STATUS, json!({})).await
    }

    pub async fn rebalance_load(&self, module_type: ModuleType) -> Result<RebalanceResult> {
        self.typed(control::REBALANCE_LOAD, &ModuleTypeParams { module_type })
            .await
    }

    pub async fn trigger_scaling(&self, module_type: ModuleType, delta: i32) -> Result<TriggerScalingResult> {
        self.typed(control::TRIGGER_SCALING, &TriggerScalingParams { module_type, delta })
            .await
    }

    pub async fn set_scaling_policy(&self, policy: ScalingPolicy) -> Result<ScalingStatus> {
        self.typed(control::SET_SCALING_POLICY, &SetScalingPolicyParams { policy })
            .await
    }

    pub async fn get_scaling_status(&self, module_type: ModuleType) -> Result<ScalingStatus> {
        self.typed(control::GET_SCALING_STATUS, &ModuleTypeParams { module_type })
            .await
    }

    pub async fn set_traffic_weight(&self, module_type: ModuleType, version: &str, weight: u32) -> Result<DeploymentState> {
        let params = SetTrafficWeightParams {
            module_type,
            version: version.to_string(),
            weight,
        };
        self.typed(control::SET_TRAFFIC_WEIGHT, &params).await
    }

    pub async fn set_traffic_split(&self, module_type: ModuleType, stable: u32, candidate: u32) -> Result<DeploymentState> {
        let params = SetTrafficSplitParams {
            module_type,
            stable,
            candidate,
        };
        self.typed(control::SET_TRAFFIC_SPLIT, &params).await
    }

    pub async fn promote_version(
        &self,
        module_type: ModuleType,
        strategy: Option<PromotionStrategy>,
    ) -> Result<DeploymentState> {
        self.typed(control::PROMOTE_VERSION, &PromoteVersionParams { module_type, strategy })
            .await
    }

    pub async fn rollback(&self, module_type: ModuleType) -> Result<DeploymentState> {
        self.typed(control::ROLLBACK, &ModuleTypeParams { module_type }).await
    }

    pub async fn cleanup_deployment(&self, module_type: ModuleType) -> Result<DeploymentState> {
        self.typed(control::CLEANUP_DEPLOYMENT, &ModuleTypeParams { module_type })
            .await
    }

    pub async fn get_deployment(&self, module_type: ModuleType) -> Result<DeploymentInfo> {
        self.typed(control::GET_DEPLOYMENT, &ModuleTypeParams { module_type })
            .await
    }

    pub async fn route_connection(&self, pattern: TrafficPattern, connection_id: Option<u64>) -> Result<RoutingDecision> {
        self.typed(control::ROUTE_CONNECTION, &RouteConnectionParams { pattern, connection_id })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use switchyard_common::{JsonRpcRequest, JsonRpcResponse, SwitchyardError};

    /// Echoes method and params back so tests can see what was sent.
    async fn echo(Json(req): Json<JsonRpcRequest>) -> Json<JsonRpcResponse> {
        if req.method == control::GET_MODULE_INFO {
            let err = SwitchyardError::NotFound(format!("instance {}", req.params["instance_id"]));
            return Json(JsonRpcResponse::error(req.id, err.to_jsonrpc()));
        }
        Json(JsonRpcResponse::success(
            req.id,
            json!({ "method": req.method, "params": req.params }),
        ))
    }

    async fn client() -> ControlPlaneClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/", post(echo))).await.unwrap();
        });
        ControlPlaneClient::new(address)
    }

    #[tokio::test]
    async fn test_params_shape() {
        let client = client().await;
        let echoed = client
            .call(control::TRIGGER_SCALING, serde_json::to_value(TriggerScalingParams {
                module_type: ModuleType::InferenceBalancer,
                delta: -1,
            }).unwrap())
            .await
            .unwrap();
        assert_eq!(echoed["method"], "trigger_scaling");
        assert_eq!(echoed["params"]["module_type"], "inference-balancer");
        assert_eq!(echoed["params"]["delta"], -1);
    }

    #[tokio::test]
    async fn test_remote_error_keeps_taxonomy() {
        let client = client().await;
        let result = client.get_module_info(InstanceId::from("alb-000404")).await;
        assert!(matches!(result, Err(SwitchyardError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_typed_result_mismatch_is_a_serialization_error() {
        let client = client().await;
        let result = client.get_routing_table().await;
        assert!(matches!(result, Err(SwitchyardError::JsonSerialization(_))));
    }
}
