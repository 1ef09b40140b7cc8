//! Method names and per-method payloads.
//!
//! Both directions are listed here: [`control`] is served by the control
//! plane, [`module`] is the contract every module instance serves.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::deployment::PromotionStrategy;
use crate::protocol::routing::Route;
use crate::protocol::scaling::ScalingPolicy;
use crate::protocol::types::{HealthReport, HealthStatus, InstanceId, ModuleType, TrafficPattern};

/// Methods served by the control plane.
pub mod control {
    pub const REGISTER_MODULE: &str = "register_module";
    pub const UNREGISTER_MODULE: &str = "unregister_module";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const LIST_MODULES: &str = "list_modules";
    pub const GET_MODULE_INFO: &str = "get_module_info";
    pub const UPDATE_ROUTING: &str = "update_routing";
    pub const GET_ROUTING_TABLE: &str = "get_routing_table";
    pub const VALIDATE_ROUTE: &str = "validate_route";
    pub const REPORT_METRICS: &str = "report_metrics";
    pub const GET_AGGREGATED_METRICS: &str = "get_aggregated_metrics";
    pub const CHECK_HEALTH: &str = "check_health";
    pub const GET_STATUS: &str = "get_status";
    pub const REBALANCE_LOAD: &str = "rebalance_load";
    pub const TRIGGER_SCALING: &str = "trigger_scaling";
    pub const SET_SCALING_POLICY: &str = "set_scaling_policy";
    pub const GET_SCALING_STATUS: &str = "get_scaling_status";
    pub const SET_TRAFFIC_WEIGHT: &str = "set_traffic_weight";
    pub const SET_TRAFFIC_SPLIT: &str = "set_traffic_split";
    pub const PROMOTE_VERSION: &str = "promote_version";
    pub const ROLLBACK: &str = "rollback";
    pub const CLEANUP_DEPLOYMENT: &str = "cleanup_deployment";
    pub const GET_DEPLOYMENT: &str = "get_deployment";
    pub const ROUTE_CONNECTION: &str = "route_connection";
}

/// Methods every module instance serves.
pub mod module {
    pub const GET_STATUS: &str = "get_status";
    pub const CAN_HANDLE: &str = "can_handle";
    pub const SCALE: &str = "scale";
    pub const SET_TRAFFIC_WEIGHT: &str = "set_traffic_weight";
    pub const GET_ACTIVE_VERSION: &str = "get_active_version";
    pub const ROLLBACK: &str = "rollback";
    pub const HEALTH_CHECK: &str = "health_check";
    pub const DEEP_HEALTH_CHECK: &str = "deep_health_check";
}

// ---- control plane payloads ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterModuleResult {
    pub instance_id: InstanceId,
    /// Interval the instance is expected to heartbeat at.
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceIdParams {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatParams {
    pub instance_id: InstanceId,
    pub load: f64,
    #[serde(default)]
    pub custom_metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatResult {
    pub health_status: HealthStatus,
}

/// Filter for `list_modules`; unset fields match everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModuleFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_type: Option<ModuleType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRoutingParams {
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRoutingResult {
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidateRouteParams {
    pub route: Route,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidateRouteResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportMetricsParams {
    pub instance_id: InstanceId,
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleTypeParams {
    pub module_type: ModuleType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CheckHealthParams {
    #[serde(default)]
    pub deep: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceProbe {
    pub instance_id: InstanceId,
    pub report: Option<HealthReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to `check_health` on the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlPlaneHealth {
    pub healthy: bool,
    pub registry_running: bool,
    pub healthy_instances: usize,
    pub total_instances: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<InstanceProbe>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebalanceResult {
    pub generation: u64,
    pub healthy_instances: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerScalingParams {
    pub module_type: ModuleType,
    pub delta: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerScalingResult {
    pub from_replicas: u32,
    pub to_replicas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetScalingPolicyParams {
    pub policy: ScalingPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetTrafficWeightParams {
    pub module_type: ModuleType,
    pub version: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetTrafficSplitParams {
    pub module_type: ModuleType,
    pub stable: u32,
    pub candidate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromoteVersionParams {
    pub module_type: ModuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<PromotionStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConnectionParams {
    pub pattern: TrafficPattern,
    /// Used to pick the blue/green bucket; random when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
}

/// One ranked candidate of a routing decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedCandidate {
    pub instance_id: InstanceId,
    pub module_type: ModuleType,
    pub address: String,
    pub version: String,
    pub priority: u8,
    pub load: f64,
}

/// A complete routing decision: the first entry is the selected instance,
/// the rest are fallbacks in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub generation: u64,
    pub pattern: TrafficPattern,
    pub ranked: Vec<RankedCandidate>,
}

impl RoutingDecision {
    pub fn selected(&self) -> Option<&RankedCandidate> {
        self.ranked.first()
    }
}

// ---- module contract payloads ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanHandleParams {
    pub pattern: TrafficPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScaleParams {
    pub target_replicas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleTrafficWeightParams {
    pub version: String,
    pub weight: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveVersion {
    pub version: String,
}
