//! JSON-RPC method dispatch for the control plane.
//!
//! Every method in [`switchyard_common::methods::control`] maps to one
//! [`ControlPlane`] call. Params that do not deserialize are answered with
//! `-32602`; domain errors keep their taxonomy code.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use switchyard_common::methods::{
    control, CheckHealthParams, HeartbeatParams, InstanceIdParams, ModuleFilter, ModuleTypeParams,
    PromoteVersionParams, ReportMetricsParams, RouteConnectionParams, SetScalingPolicyParams, SetTrafficSplitParams,
    SetTrafficWeightParams, TriggerScalingParams, UpdateRoutingParams, ValidateRouteParams,
};
use switchyard_common::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RegisterModuleRequest, Result};

use crate::control_plane::ControlPlane;

type Reply = std::result::Result<Value, JsonRpcError>;

fn params<T: DeserializeOwned>(params: Value) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))
}

/// Like [`params`], but a missing params member means "all defaults".
fn params_or_default<T: DeserializeOwned + Default>(value: Value) -> std::result::Result<T, JsonRpcError> {
    if value.is_null() {
        Ok(T::default())
    } else {
        params(value)
    }
}

fn reply<T: Serialize>(result: Result<T>) -> Reply {
    let value = result.map_err(|e| e.to_jsonrpc())?;
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
}

pub struct ControlPlaneRouter {
    control: Arc<ControlPlane>,
}

impl ControlPlaneRouter {
    pub fn new(control: Arc<ControlPlane>) -> Self {
        Self { control }
    }

    pub fn control(&self) -> &Arc<ControlPlane> {
        &self.control
    }

    pub async fn handle_request(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %req.method, "control plane request");
        match self.dispatch(&req.method, req.params).await {
            Ok(result) => JsonRpcResponse::success(req.id, result),
            Err(error) => JsonRpcResponse::error(req.id, error),
        }
    }

    async fn dispatch(&self, method: &str, raw: Value) -> Reply {
        let cp = &self.control;
        match method {
            control::REGISTER_MODULE => {
                let request: RegisterModuleRequest = params(raw)?;
                reply(cp.register_module(request).await)
            }
            control::UNREGISTER_MODULE => {
                let p: InstanceIdParams = params(raw)?;
                reply(cp.unregister_module(p.instance_id).await)
            }
            control::HEARTBEAT => {
                let p: HeartbeatParams = params(raw)?;
                reply(cp.heartbeat(p).await)
            }
            control::LIST_MODULES => {
                let filter: ModuleFilter = params_or_default(raw)?;
                reply(cp.list_modules(filter).await)
            }
            control::GET_MODULE_INFO => {
                let p: InstanceIdParams = params(raw)?;
                reply(cp.get_module_info(p.instance_id).await)
            }
            control::UPDATE_ROUTING => {
                let p: UpdateRoutingParams = params(raw)?;
                reply(cp.update_routing(p.routes).await)
            }
            control::GET_ROUTING_TABLE => reply(Ok(cp.get_routing_table())),
            control::VALIDATE_ROUTE => {
                let p: ValidateRouteParams = params(raw)?;
                reply(Ok(cp.validate_route(p.route)))
            }
            control::REPORT_METRICS => {
                let p: ReportMetricsParams = params(raw)?;
                cp.report_metrics(p.instance_id, p.metrics)
                    .await
                    .map_err(|e| e.to_jsonrpc())?;
                Ok(json!({ "accepted": true }))
            }
            control::GET_AGGREGATED_METRICS => {
                let p: ModuleTypeParams = params(raw)?;
                reply(Ok(cp.get_aggregated_metrics(p.module_type)))
            }
            control::CHECK_HEALTH => {
                let p: CheckHealthParams = params_or_default(raw)?;
                reply(Ok(cp.check_health(p).await))
            }
            control::GET_STATUS => reply(Ok(cp.get_status().await)),
            control::REBALANCE_LOAD => {
                let p: ModuleTypeParams = params(raw)?;
                reply(cp.rebalance_load(p.module_type).await)
            }
            control::TRIGGER_SCALING => {
                let p: TriggerScalingParams = params(raw)?;
                reply(cp.trigger_scaling(p).await)
            }
            control::SET_SCALING_POLICY => {
                let p: SetScalingPolicyParams = params(raw)?;
                let module_type = p.policy.module_type;
                cp.set_scaling_policy(p.policy).await.map_err(|e| e.to_jsonrpc())?;
                reply(cp.get_scaling_status(module_type).await)
            }
            control::GET_SCALING_STATUS => {
                let p: ModuleTypeParams = params(raw)?;
                reply(cp.get_scaling_status(p.module_type).await)
            }
            control::SET_TRAFFIC_WEIGHT => {
                let p: SetTrafficWeightParams = params(raw)?;
                reply(cp.set_traffic_weight(p).await)
            }
            control::SET_TRAFFIC_SPLIT => {
                let p: SetTrafficSplitParams = params(raw)?;
                reply(cp.set_traffic_split(p).await)
            }
            control::PROMOTE_VERSION => {
                let p: PromoteVersionParams = params(raw)?;
                reply(cp.promote_version(p).await)
            }
            control::ROLLBACK => {
                let p: ModuleTypeParams = params(raw)?;
                reply(cp.rollback(p.module_type).await)
            }
            control::CLEANUP_DEPLOYMENT => {
                let p: ModuleTypeParams = params(raw)?;
                reply(cp.cleanup_deployment(p.module_type).await)
            }
            control::GET_DEPLOYMENT => {
                let p: ModuleTypeParams = params(raw)?;
                reply(cp.get_deployment(p.module_type).await)
            }
            control::ROUTE_CONNECTION => {
                let p: RouteConnectionParams = params(raw)?;
                reply(cp.route_connection(p).await)
            }
            _ => Err(JsonRpcError::method_not_found()),
        }
    }
}
