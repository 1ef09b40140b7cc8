//! Control Plane
//!
//! [`ControlPlane`] wires the registry writer, heartbeat monitor, routing
//! engine, scaling controller and deployment orchestrator together and
//! exposes every remote operation as an async method. The JSON-RPC router
//! is a thin layer over these methods.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchyard_control::testing::MockModuleClient;
//! use switchyard_control::{ControlPlane, ControlPlaneConfig};
//!
//! # async fn run() -> switchyard_common::Result<()> {
//! let control = ControlPlane::builder(ControlPlaneConfig::default(), Arc::new(MockModuleClient::new()))
//!     .start()
//!     .await?;
//! let table = control.get_routing_table();
//! assert!(table.entries.is_empty());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use switchyard_common::methods::{
    CheckHealthParams, ControlPlaneHealth, HeartbeatParams, HeartbeatResult, ModuleFilter, PromoteVersionParams,
    RebalanceResult, RegisterModuleResult, RouteConnectionParams, RoutingDecision, SetTrafficSplitParams,
    SetTrafficWeightParams, TriggerScalingParams, TriggerScalingResult, UpdateRoutingResult, ValidateRouteResult,
};
use switchyard_common::rate_limit::RateLimiter;
use switchyard_common::{
    validate_routes, DeploymentInfo, DeploymentState, InstanceId, ModuleClient, ModuleInstanceInfo, ModuleType,
    RegisterModuleRequest, Result, Route, RoutingTableView, ScalingEvent, ScalingPolicy, ScalingStatus, SwitchyardError,
};
use switchyard_metrics::{AggregatedMetrics, ControlPlaneMetrics, MetricsRegistry, MetricsSink, TracingMetricsSink};

use crate::audit::{AuditCategory, AuditEvent, AuditSink, TracingAuditSink};
use crate::circuit_breaker::CircuitBreakers;
use crate::config::ControlPlaneConfig;
use crate::deployment::DeploymentOrchestrator;
use crate::entitlement::{Entitlements, StaticEntitlements};
use crate::heartbeat::HeartbeatMonitor;
use crate::persistence::{StatePersister, StateStore, STATE_VERSION};
use crate::registry::{spawn_registry, RegistryHandle, RegistryState};
use crate::router::{RoutingEngine, RoutingRequest};
use crate::scaling::ScalingController;

/// Registered and Healthy instance counts of one module type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipCounts {
    pub registered: usize,
    pub healthy: usize,
}

/// Answer to `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneStatus {
    pub generation: u64,
    pub registry_running: bool,
    pub membership: BTreeMap<ModuleType, MembershipCounts>,
    pub open_breakers: usize,
    pub metrics: ControlPlaneMetrics,
    pub scaling: Vec<ScalingStatus>,
    /// Recent scaling events across all module types, oldest first.
    pub scaling_history: Vec<ScalingEvent>,
    pub deployments: Vec<DeploymentState>,
}

/// Builder for [`ControlPlane`].
///
/// The module client is required; audit, metrics export and entitlements
/// default to tracing sinks and the config's `max_instances`.
pub struct ControlPlaneBuilder {
    config: ControlPlaneConfig,
    modules: Arc<dyn ModuleClient>,
    audit: Arc<dyn AuditSink>,
    sink: Arc<dyn MetricsSink>,
    entitlements: Option<Arc<dyn Entitlements>>,
    background: bool,
}

impl ControlPlaneBuilder {
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn entitlements(mut self, entitlements: Arc<dyn Entitlements>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    /// Skips the sweep, scaling and deployment loops. Callers drive them
    /// through [`ControlPlane::monitor`], [`ControlPlane::scaling`] and
    /// [`ControlPlane::deployments`].
    pub fn without_background_tasks(mut self) -> Self {
        self.background = false;
        self
    }

    /// Loads persisted state, starts the registry writer and, unless
    /// disabled, the periodic loops.
    pub async fn start(self) -> Result<ControlPlane> {
        let config = self.config;
        config.validate()?;

        let store = config.state_file.clone().map(StateStore::new);
        let persisted = match &store {
            Some(store) => store.load().await?,
            None => None,
        };

        let mut policies: BTreeMap<ModuleType, ScalingPolicy> = config
            .scaling_policies
            .iter()
            .map(|p| (p.module_type, p.clone()))
            .collect();

        let (routes, generation, deployments) = match persisted {
            Some(state) => {
                if state.version != STATE_VERSION {
                    return Err(SwitchyardError::InvalidRequest(format!(
                        "state file version {} is not supported (expected {})",
                        state.version, STATE_VERSION
                    )));
                }
                info!(
                    generation = state.generation,
                    routes = state.routes.len(),
                    deployments = state.deployments.len(),
                    "restored persisted state"
                );
                for policy in state.scaling_policies {
                    policies.insert(policy.module_type, policy);
                }
                // the restored table has no instances, so it is a new generation
                (state.routes, state.generation + 1, state.deployments)
            }
            None => (config.routes.clone(), 0, Vec::new()),
        };

        let entitlements = self
            .entitlements
            .unwrap_or_else(|| Arc::new(StaticEntitlements::new(config.max_instances)) as Arc<dyn Entitlements>);
        let state = RegistryState::new(
            config.heartbeat.clone(),
            routes,
            generation,
            entitlements,
            Arc::clone(&self.audit),
        );
        let snapshots = state.snapshots();
        let (registry, registry_task) = spawn_registry(state, config.registry.queue_capacity);

        let deployment_orchestrator = Arc::new(DeploymentOrchestrator::new(
            config.deployment.clone(),
            Arc::clone(&self.modules),
            snapshots.clone(),
            Arc::clone(&self.audit),
        ));
        deployment_orchestrator.restore(deployments).await;

        let metrics = Arc::new(MetricsRegistry::new());
        let breakers = Arc::new(CircuitBreakers::new(config.circuit_breaker.clone()));
        let limiter = Arc::new(RateLimiter::new());

        let router = RoutingEngine::new(
            config.routing.clone(),
            config.retry.clone(),
            registry.clone(),
            Arc::clone(&deployment_orchestrator),
            Arc::clone(&self.modules),
            Arc::clone(&breakers),
            Arc::clone(&limiter),
            Arc::clone(&metrics),
        );
        let monitor = Arc::new(HeartbeatMonitor::new(
            config.heartbeat.clone(),
            registry.clone(),
            Arc::clone(&metrics),
            breakers,
            Arc::clone(router.cache()),
            limiter,
            Arc::clone(&self.sink),
            Arc::clone(&self.modules),
        ));
        let scaling = Arc::new(ScalingController::new(
            config.scaling.clone(),
            config.retry.clone(),
            snapshots.clone(),
            Arc::clone(&metrics),
            self.modules,
            self.sink,
            Arc::clone(&self.audit),
        ));
        for policy in policies.into_values() {
            scaling.set_policy(policy).await?;
        }

        let mut tasks = vec![registry_task];
        let persister = store.map(|store| {
            Arc::new(StatePersister::new(
                store,
                snapshots,
                Arc::clone(&scaling),
                Arc::clone(&deployment_orchestrator),
            ))
        });
        if let Some(persister) = &persister {
            tasks.push(persister.spawn());
        }
        if self.background {
            tasks.push(monitor.spawn());
            tasks.push(scaling.spawn());
            tasks.push(deployment_orchestrator.spawn());
        }

        info!(
            generation = registry.snapshot().generation,
            persistent = persister.is_some(),
            "control plane started"
        );

        Ok(ControlPlane {
            config,
            registry,
            deployments: deployment_orchestrator,
            router,
            monitor,
            scaling,
            metrics,
            audit: self.audit,
            persister,
            tasks: Mutex::new(tasks),
        })
    }
}

/// The running control plane.
///
/// Dropping it stops every background task it started.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    registry: RegistryHandle,
    deployments: Arc<DeploymentOrchestrator>,
    router: RoutingEngine,
    monitor: Arc<HeartbeatMonitor>,
    scaling: Arc<ScalingController>,
    metrics: Arc<MetricsRegistry>,
    audit: Arc<dyn AuditSink>,
    persister: Option<Arc<StatePersister>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlane {
    pub fn builder(config: ControlPlaneConfig, modules: Arc<dyn ModuleClient>) -> ControlPlaneBuilder {
        ControlPlaneBuilder {
            config,
            modules,
            audit: Arc::new(TracingAuditSink),
            sink: Arc::new(TracingMetricsSink),
            entitlements: None,
            background: true,
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn router(&self) -> &RoutingEngine {
        &self.router
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn scaling(&self) -> &Arc<ScalingController> {
        &self.scaling
    }

    pub fn deployments(&self) -> &Arc<DeploymentOrchestrator> {
        &self.deployments
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Aborts every background task. Further calls fail with `Shutdown`.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("control plane stopped");
    }

    async fn persist(&self) {
        if let Some(persister) = &self.persister {
            persister.save().await;
        }
    }

    fn forget(&self, instance_id: &InstanceId) {
        self.metrics.remove_instance(instance_id);
        self.router.breakers().remove(instance_id);
        self.router.cache().evict_instance(instance_id);
    }

    // ---- registry ----

    pub async fn register_module(&self, request: RegisterModuleRequest) -> Result<RegisterModuleResult> {
        let module_type = request.module_type;
        let version = request.version.clone();
        let outcome = self.registry.register(request).await?;
        if let Some(replaced) = &outcome.replaced {
            self.forget(replaced);
        }
        if self.deployments.ensure_initialized(module_type, &version) {
            self.persist().await;
        }
        Ok(RegisterModuleResult {
            instance_id: outcome.instance_id,
            heartbeat_interval_ms: self.config.heartbeat.interval_ms,
        })
    }

    pub async fn unregister_module(&self, instance_id: InstanceId) -> Result<ModuleInstanceInfo> {
        let info = self.registry.unregister(instance_id.clone()).await?;
        self.forget(&instance_id);
        Ok(info)
    }

    pub async fn heartbeat(&self, params: HeartbeatParams) -> Result<HeartbeatResult> {
        let ack = self
            .monitor
            .ingest(params.instance_id, params.load, params.custom_metrics)
            .await?;
        Ok(HeartbeatResult {
            health_status: ack.health_status,
        })
    }

    pub async fn list_modules(&self, filter: ModuleFilter) -> Result<Vec<ModuleInstanceInfo>> {
        self.registry.list(filter).await
    }

    pub async fn get_module_info(&self, instance_id: InstanceId) -> Result<ModuleInstanceInfo> {
        self.registry.get(instance_id).await
    }

    // ---- routing ----

    pub async fn update_routing(&self, routes: Vec<Route>) -> Result<UpdateRoutingResult> {
        let generation = self.registry.update_routes(routes).await?;
        self.persist().await;
        Ok(UpdateRoutingResult { generation })
    }

    pub fn get_routing_table(&self) -> RoutingTableView {
        self.registry.snapshot().view()
    }

    /// Dry run: checks the current table with `route` appended. Nothing is committed.
    pub fn validate_route(&self, route: Route) -> ValidateRouteResult {
        let mut table = self.registry.snapshot().routes.clone();
        table.push(route);
        match validate_routes(&table) {
            Ok(()) => ValidateRouteResult {
                valid: true,
                errors: Vec::new(),
            },
            Err(errors) => ValidateRouteResult { valid: false, errors },
        }
    }

    pub async fn route_connection(&self, params: RouteConnectionParams) -> Result<RoutingDecision> {
        let connection_id = params.connection_id.unwrap_or_else(rand::random);
        self.router
            .decide(&RoutingRequest::new(params.pattern, connection_id))
            .await
    }

    /// Forces a snapshot rebuild and drops cached CanHandle answers of the type.
    pub async fn rebalance_load(&self, module_type: ModuleType) -> Result<RebalanceResult> {
        let before = self.registry.snapshot();
        for instance in before.healthy(module_type) {
            self.router.cache().evict_instance(&instance.instance_id);
        }
        let generation = self.registry.rebuild().await?;
        let healthy_instances = self.registry.snapshot().healthy(module_type).len();
        info!(module_type = %module_type, generation, healthy_instances, "rebalanced");
        self.audit.record(
            AuditEvent::new(AuditCategory::Routing, "rebalanced", module_type)
                .with_detail(json!({ "generation": generation })),
        );
        Ok(RebalanceResult {
            generation,
            healthy_instances,
        })
    }

    // ---- metrics and health ----

    pub async fn report_metrics(
        &self,
        instance_id: InstanceId,
        metrics: HashMap<String, f64>,
    ) -> Result<()> {
        self.monitor.report_metrics(instance_id, metrics).await
    }

    /// Aggregates over the type's Healthy instances.
    pub fn get_aggregated_metrics(&self, module_type: ModuleType) -> AggregatedMetrics {
        let snapshot = self.registry.snapshot();
        self.metrics.aggregate(module_type, &snapshot.healthy_ids(module_type))
    }

    pub async fn check_health(&self, params: CheckHealthParams) -> ControlPlaneHealth {
        let snapshot = self.registry.snapshot();
        let registry_running = self.registry.is_running();
        let probes = self.monitor.probe(params.deep).await;
        debug!(deep = params.deep, probes = probes.len(), "health check");
        ControlPlaneHealth {
            healthy: registry_running,
            registry_running,
            healthy_instances: snapshot.total_healthy(),
            total_instances: snapshot.total_registered(),
            probes,
        }
    }

    pub async fn get_status(&self) -> ControlPlaneStatus {
        let snapshot = self.registry.snapshot();
        let membership = snapshot
            .membership
            .iter()
            .map(|(t, m)| {
                (
                    *t,
                    MembershipCounts {
                        registered: m.registered,
                        healthy: m.healthy.len(),
                    },
                )
            })
            .collect();
        ControlPlaneStatus {
            generation: snapshot.generation,
            registry_running: self.registry.is_running(),
            membership,
            open_breakers: self.router.breakers().open_count(),
            metrics: self.metrics.snapshot(),
            scaling: self.scaling.statuses().await,
            scaling_history: self.scaling.history().await,
            deployments: self.deployments.all(),
        }
    }

    // ---- scaling ----

    pub async fn trigger_scaling(&self, params: TriggerScalingParams) -> Result<TriggerScalingResult> {
        self.scaling.trigger_scaling(params.module_type, params.delta).await
    }

    pub async fn set_scaling_policy(&self, policy: ScalingPolicy) -> Result<()> {
        self.scaling.set_policy(policy).await?;
        self.persist().await;
        Ok(())
    }

    pub async fn get_scaling_status(&self, module_type: ModuleType) -> Result<ScalingStatus> {
        self.scaling.status(module_type).await
    }

    // ---- blue/green ----

    pub async fn set_traffic_weight(&self, params: SetTrafficWeightParams) -> Result<DeploymentState> {
        let state = self
            .deployments
            .set_traffic_weight(params.module_type, &params.version, params.weight)
            .await?;
        self.persist().await;
        Ok(state)
    }

    pub async fn set_traffic_split(&self, params: SetTrafficSplitParams) -> Result<DeploymentState> {
        let state = self
            .deployments
            .set_traffic_split(params.module_type, params.stable, params.candidate)
            .await?;
        self.persist().await;
        Ok(state)
    }

    pub async fn promote_version(&self, params: PromoteVersionParams) -> Result<DeploymentState> {
        let state = self
            .deployments
            .promote_version(params.module_type, params.strategy)
            .await?;
        self.persist().await;
        Ok(state)
    }

    pub async fn rollback(&self, module_type: ModuleType) -> Result<DeploymentState> {
        let state = self.deployments.rollback(module_type).await?;
        self.persist().await;
        Ok(state)
    }

    pub async fn cleanup_deployment(&self, module_type: ModuleType) -> Result<DeploymentState> {
        let state = self.deployments.cleanup(module_type).await?;
        self.persist().await;
        Ok(state)
    }

    pub async fn get_deployment(&self, module_type: ModuleType) -> Result<DeploymentInfo> {
        self.deployments.info(module_type).await
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::testing::MockModuleClient;
    use std::time::Duration;
    use switchyard_common::{DeploymentPhase, HealthStatus};

    const ALB: ModuleType = ModuleType::ApplicationBalancer;

    fn alb_route() -> Route {
        Route::new("tcp:443".parse().unwrap(), ALB, 50)
    }

    async fn start(config: ControlPlaneConfig) -> (ControlPlane, Arc<MockModuleClient>) {
        let modules = Arc::new(MockModuleClient::new());
        let control = ControlPlane::builder(config, modules.clone())
            .audit_sink(Arc::new(MemoryAuditSink::default()))
            .without_background_tasks()
            .start()
            .await
            .unwrap();
        (control, modules)
    }

    async fn join(control: &ControlPlane, host: &str, version: &str) -> (InstanceId, String) {
        let address = format!("{}:9000", host);
        let result = control
            .register_module(RegisterModuleRequest {
                instance_id: None,
                module_type: ALB,
                address: address.clone(),
                capabilities: vec!["tcp:443".parse().unwrap()],
                version: version.into(),
            })
            .await
            .unwrap();
        control
            .heartbeat(HeartbeatParams {
                instance_id: result.instance_id.clone(),
                load: 0.2,
                custom_metrics: HashMap::new(),
            })
            .await
            .unwrap();
        (result.instance_id, address)
    }

    #[tokio::test]
    async fn test_register_heartbeat_and_route() {
        let config = ControlPlaneConfig {
            routes: vec![alb_route()],
            ..Default::default()
        };
        let (control, modules) = start(config).await;
        let (a, a_addr) = join(&control, "10.0.0.1", "v1").await;
        let (_, b_addr) = join(&control, "10.0.0.2", "v1").await;
        modules.answer(&a_addr, 80, 0.4);
        modules.answer(&b_addr, 60, 0.1);

        let decision = control
            .route_connection(RouteConnectionParams {
                pattern: "tcp:443".parse().unwrap(),
                connection_id: None,
            })
            .await
            .unwrap();
        assert_eq!(decision.selected().map(|c| c.instance_id.clone()), Some(a));

        let deployment = control.get_deployment(ALB).await.unwrap();
        assert_eq!(deployment.state.stable_version, "v1");
        assert_eq!(deployment.state.traffic_weight_stable, 100);
    }

    #[tokio::test]
    async fn test_register_returns_heartbeat_interval() {
        let (control, _) = start(ControlPlaneConfig::default()).await;
        let result = control
            .register_module(RegisterModuleRequest {
                instance_id: None,
                module_type: ModuleType::DatabaseBalancer,
                address: "db-1:9000".into(),
                capabilities: vec![],
                version: "v7".into(),
            })
            .await
            .unwrap();
        assert_eq!(result.heartbeat_interval_ms, 10_000);
        assert!(result.instance_id.as_str().starts_with("dblb-"));

        let info = control.get_module_info(result.instance_id).await.unwrap();
        assert_eq!(info.health_status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_unregister_forgets_instance() {
        let (control, _) = start(ControlPlaneConfig::default()).await;
        let (id, _) = join(&control, "10.0.0.1", "v1").await;
        assert!(control.metrics().sample(&id).is_some());

        control.unregister_module(id.clone()).await.unwrap();
        assert!(control.metrics().sample(&id).is_none());
        assert!(matches!(
            control.get_module_info(id.clone()).await,
            Err(SwitchyardError::NotFound(_))
        ));
        assert!(matches!(
            control.unregister_module(id).await,
            Err(SwitchyardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_route_is_a_dry_run() {
        let config = ControlPlaneConfig {
            routes: vec![alb_route()],
            ..Default::default()
        };
        let (control, _) = start(config).await;
        let generation = control.get_routing_table().generation;

        let duplicate = control.validate_route(alb_route());
        assert!(!duplicate.valid);
        assert!(duplicate.errors[0].contains("duplicate"));

        let other = control.validate_route(Route::new("postgres:5432".parse().unwrap(), ModuleType::DatabaseBalancer, 40));
        assert!(other.valid);

        let too_high = control.validate_route(Route::new("udp:53".parse().unwrap(), ModuleType::NetworkBalancer, 140));
        assert!(!too_high.valid);

        assert_eq!(control.get_routing_table().generation, generation);
        assert_eq!(control.get_routing_table().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_status_counts_membership() {
        let (control, _) = start(ControlPlaneConfig::default()).await;
        join(&control, "10.0.0.1", "v1").await;
        control
            .register_module(RegisterModuleRequest {
                instance_id: None,
                module_type: ALB,
                address: "10.0.0.9:9000".into(),
                capabilities: vec![],
                version: "v1".into(),
            })
            .await
            .unwrap();
        control
            .set_scaling_policy(ScalingPolicy::load_based(ALB, 1, 4))
            .await
            .unwrap();

        let status = control.get_status().await;
        assert!(status.registry_running);
        assert_eq!(
            status.membership.get(&ALB),
            Some(&MembershipCounts {
                registered: 2,
                healthy: 1
            })
        );
        assert_eq!(status.scaling.len(), 1);
        assert_eq!(status.deployments.len(), 1);

        let health = control.check_health(CheckHealthParams { deep: true }).await;
        assert!(health.healthy);
        assert_eq!(health.total_instances, 2);
        assert_eq!(health.probes.len(), 1);
    }

    #[tokio::test]
    async fn test_rebalance_publishes_new_generation() {
        let (control, _) = start(ControlPlaneConfig::default()).await;
        join(&control, "10.0.0.1", "v1").await;
        let before = control.get_routing_table().generation;
        let result = control.rebalance_load(ALB).await.unwrap();
        assert_eq!(result.generation, before + 1);
        assert_eq!(result.healthy_instances, 1);
    }

    #[tokio::test]
    async fn test_reported_metrics_are_aggregated() {
        let (control, _) = start(ControlPlaneConfig::default()).await;
        let (a, _) = join(&control, "10.0.0.1", "v1").await;
        let (b, _) = join(&control, "10.0.0.2", "v1").await;
        control
            .report_metrics(a, HashMap::from([("rps".to_string(), 100.0)]))
            .await
            .unwrap();
        control
            .report_metrics(b, HashMap::from([("rps".to_string(), 300.0)]))
            .await
            .unwrap();

        let aggregated = control.get_aggregated_metrics(ALB);
        assert_eq!(aggregated.instance_count, 2);
        let rps = &aggregated.custom["rps"];
        assert_eq!((rps.min, rps.max, rps.avg), (100.0, 300.0, 200.0));

        let missing = control
            .report_metrics(InstanceId::from("alb-999999"), HashMap::new())
            .await;
        assert!(matches!(missing, Err(SwitchyardError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlPlaneConfig {
            state_file: Some(dir.path().join("state.json")),
            ..Default::default()
        };

        let (first, _) = start(config.clone()).await;
        join(&first, "10.0.0.1", "v1").await;
        first.update_routing(vec![alb_route()]).await.unwrap();
        first
            .set_scaling_policy(ScalingPolicy::load_based(ALB, 2, 6))
            .await
            .unwrap();
        first
            .set_traffic_weight(SetTrafficWeightParams {
                module_type: ALB,
                version: "v2".into(),
                weight: 20,
            })
            .await
            .unwrap();
        // a health-driven republish after the last administrative change
        join(&first, "10.0.0.2", "v1").await;
        let generation = first.get_routing_table().generation;
        let store = StateStore::new(dir.path().join("state.json"));
        let mut saved = 0;
        for _ in 0..100 {
            saved = store.load().await.unwrap().map(|s| s.generation).unwrap_or(0);
            if saved == generation {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(saved, generation);
        drop(first);

        let (second, _) = start(config).await;
        let table = second.get_routing_table();
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.generation, generation + 1);

        let status = second.get_scaling_status(ALB).await.unwrap();
        assert_eq!(status.policy.min_replicas, 2);

        let deployment = second.get_deployment(ALB).await.unwrap().state;
        assert_eq!(deployment.candidate_version.as_deref(), Some("v2"));
        assert_eq!(deployment.traffic_weight_candidate, 20);
        assert_eq!(deployment.phase, DeploymentPhase::Canary);

        // instances are not persisted
        assert!(second.list_modules(ModuleFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ControlPlaneConfig {
            routes: vec![alb_route(), alb_route()],
            ..Default::default()
        };
        let result = ControlPlane::builder(config, Arc::new(MockModuleClient::new()))
            .start()
            .await;
        assert!(matches!(result, Err(SwitchyardError::InvalidRoute(_))));
    }
}
