//! Module Registry
//!
//! All registry mutations (register, heartbeat, unregister, route updates,
//! health sweeps, breaker isolation) are applied by one writer task that
//! owns a [`RegistryState`]. Callers talk to it through a cloneable
//! [`RegistryHandle`] over a bounded queue. After every change that affects
//! routing the writer publishes a new [`RoutingSnapshot`]; the routing path
//! only ever reads that snapshot and never waits on the writer.
//!
//! Heartbeats and registrations are offered with `try_send`: a full queue
//! rejects them with [`SwitchyardError::Overloaded`] and the instance retries.

use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchyard_common::methods::ModuleFilter;
use switchyard_common::{
    validate_routes, HealthStatus, InstanceId, ModuleInstanceInfo, ModuleType, RegisterModuleRequest, Result, Route,
    SwitchyardError,
};

use crate::audit::{AuditCategory, AuditEvent, AuditSink};
use crate::config::HeartbeatConfig;
use crate::entitlement::Entitlements;
use crate::instance::{HealthTransition, ModuleInstance};
use crate::snapshot::{RoutingSnapshot, SnapshotCell};

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterOutcome {
    pub instance_id: InstanceId,
    /// An Unhealthy record at the same address that this registration replaced.
    pub replaced: Option<InstanceId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatAck {
    pub module_type: ModuleType,
    pub health_status: HealthStatus,
    /// Load as stored, clamped to `[0, 1]`.
    pub load: f64,
}

/// What one health sweep changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub demoted: Vec<InstanceId>,
    pub recovered: Vec<InstanceId>,
    pub removed: Vec<InstanceId>,
    pub generation: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.demoted.is_empty() && self.recovered.is_empty() && self.removed.is_empty()
    }
}

/// Registry contents, owned by exactly one writer.
pub struct RegistryState {
    config: HeartbeatConfig,
    instances: BTreeMap<InstanceId, ModuleInstance>,
    routes: Vec<Route>,
    generation: u64,
    next_seq: u64,
    entitlements: Arc<dyn Entitlements>,
    audit: Arc<dyn AuditSink>,
    snapshots: SnapshotCell,
}

impl RegistryState {
    /// Creates the state and publishes its first (empty) snapshot at `generation`.
    pub fn new(
        config: HeartbeatConfig,
        routes: Vec<Route>,
        generation: u64,
        entitlements: Arc<dyn Entitlements>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let snapshots = SnapshotCell::new(RoutingSnapshot::build(generation, &routes, std::iter::empty()));
        Self {
            config,
            instances: BTreeMap::new(),
            routes,
            generation,
            next_seq: 1,
            entitlements,
            audit,
            snapshots,
        }
    }

    pub fn snapshots(&self) -> SnapshotCell {
        self.snapshots.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn publish(&mut self) {
        self.generation += 1;
        let snapshot = RoutingSnapshot::build(self.generation, &self.routes, self.instances.values());
        debug!(
            generation = self.generation,
            healthy = snapshot.total_healthy(),
            "published routing snapshot"
        );
        self.snapshots.publish(snapshot);
    }

    fn next_id(&mut self, module_type: ModuleType) -> InstanceId {
        loop {
            let id = InstanceId::new(format!("{}-{:06}", module_type.id_prefix(), self.next_seq));
            self.next_seq += 1;
            if !self.instances.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn register(&mut self, request: RegisterModuleRequest, now: Instant) -> Result<RegisterOutcome> {
        if request.address.trim().is_empty() {
            return Err(SwitchyardError::InvalidRequest("address must not be empty".into()));
        }
        if request.version.trim().is_empty() {
            return Err(SwitchyardError::InvalidRequest("version must not be empty".into()));
        }

        // An Unhealthy record at the same address is a dead predecessor and is replaced.
        let mut replaced = None;
        if let Some(existing) = self
            .instances
            .values()
            .find(|i| i.module_type == request.module_type && i.address == request.address)
        {
            if existing.health_status != HealthStatus::Unhealthy {
                return Err(SwitchyardError::RegistrationConflict {
                    module_type: request.module_type,
                    address: request.address,
                });
            }
            replaced = Some(existing.instance_id.clone());
        }

        if let Some(id) = &request.instance_id {
            if self.instances.contains_key(id) && replaced.as_ref() != Some(id) {
                return Err(SwitchyardError::InvalidRequest(format!("instance id {} already in use", id)));
            }
        }

        if let Some(limit) = self.entitlements.max_instances() {
            let active = self.instances.len() - usize::from(replaced.is_some());
            if active >= limit {
                return Err(SwitchyardError::EntitlementExceeded { limit });
            }
        }

        if let Some(old) = &replaced {
            self.instances.remove(old);
            info!(instance_id = %old, "replacing unhealthy instance at {}", request.address);
            self.audit.record(
                AuditEvent::new(AuditCategory::Registry, "replaced", old)
                    .with_detail(json!({ "address": request.address })),
            );
        }

        let instance_id = match request.instance_id.clone() {
            Some(id) => id,
            None => self.next_id(request.module_type),
        };
        let instance = ModuleInstance::new(instance_id.clone(), request, now);
        info!(
            instance_id = %instance_id,
            module_type = %instance.module_type,
            version = %instance.version,
            "registered module instance at {}",
            instance.address
        );
        self.audit.record(
            AuditEvent::new(AuditCategory::Registry, "registered", &instance_id).with_detail(json!({
                "module_type": instance.module_type,
                "address": instance.address,
                "version": instance.version,
            })),
        );
        self.instances.insert(instance_id.clone(), instance);
        self.publish();

        Ok(RegisterOutcome { instance_id, replaced })
    }

    pub fn heartbeat(
        &mut self,
        instance_id: &InstanceId,
        load: f64,
        custom_metrics: HashMap<String, f64>,
        now: Instant,
    ) -> Result<HeartbeatAck> {
        if !load.is_finite() {
            return Err(SwitchyardError::InvalidRequest(format!("load must be finite, got {}", load)));
        }
        let threshold = self.config.degraded_load_threshold;
        let instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| SwitchyardError::NotFound(format!("instance {}", instance_id)))?;

        let load = load.clamp(0.0, 1.0);
        let transition = instance.apply_heartbeat(load, custom_metrics, threshold, now);
        let ack = HeartbeatAck {
            module_type: instance.module_type,
            health_status: transition.to,
            load,
        };
        if transition.changed() {
            self.record_health(instance_id, transition, "heartbeat");
            self.publish();
        }
        Ok(ack)
    }

    pub fn unregister(&mut self, instance_id: &InstanceId, now: Instant) -> Result<ModuleInstanceInfo> {
        let instance = self
            .instances
            .remove(instance_id)
            .ok_or_else(|| SwitchyardError::NotFound(format!("instance {}", instance_id)))?;
        info!(instance_id = %instance_id, module_type = %instance.module_type, "unregistered module instance");
        self.audit.record(AuditEvent::new(AuditCategory::Registry, "unregistered", instance_id));
        self.publish();
        Ok(instance.info(now))
    }

    pub fn get(&self, instance_id: &InstanceId, now: Instant) -> Result<ModuleInstanceInfo> {
        self.instances
            .get(instance_id)
            .map(|i| i.info(now))
            .ok_or_else(|| SwitchyardError::NotFound(format!("instance {}", instance_id)))
    }

    pub fn list(&self, filter: &ModuleFilter, now: Instant) -> Vec<ModuleInstanceInfo> {
        self.instances
            .values()
            .filter(|i| filter.module_type.map(|t| t == i.module_type).unwrap_or(true))
            .filter(|i| filter.health_status.map(|h| h == i.health_status).unwrap_or(true))
            .filter(|i| filter.version.as_ref().map(|v| *v == i.version).unwrap_or(true))
            .map(|i| i.info(now))
            .collect()
    }

    /// Replaces the route table; the whole table is rejected if any route is invalid.
    pub fn update_routes(&mut self, routes: Vec<Route>) -> Result<u64> {
        validate_routes(&routes).map_err(|errors| SwitchyardError::InvalidRoute(errors.join("; ")))?;
        info!("route table updated: {} routes", routes.len());
        self.audit.record(
            AuditEvent::new(AuditCategory::Routing, "routes_updated", "routing-table")
                .with_detail(json!({ "routes": routes.iter().map(Route::key).collect::<Vec<_>>() })),
        );
        self.routes = routes;
        self.publish();
        Ok(self.generation)
    }

    /// Publishes a fresh snapshot even when nothing changed.
    pub fn rebuild(&mut self) -> u64 {
        self.publish();
        self.generation
    }

    /// Demotes silent instances and removes those past the grace period.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let stale_after = self.config.stale_after();
        let remove_after = self.config.remove_after();
        let threshold = self.config.degraded_load_threshold;
        let mut report = SweepReport::default();

        let mut transitions = Vec::new();
        for instance in self.instances.values_mut() {
            let transition = instance.sweep(stale_after, threshold, now);
            if transition.changed() {
                transitions.push((instance.instance_id.clone(), transition));
            }
        }
        for (id, transition) in transitions {
            if transition.to == HealthStatus::Unhealthy {
                report.demoted.push(id.clone());
            } else {
                report.recovered.push(id.clone());
            }
            self.record_health(&id, transition, "sweep");
        }

        let expired: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|i| i.silence(now) > remove_after)
            .map(|i| i.instance_id.clone())
            .collect();
        for id in expired {
            self.instances.remove(&id);
            info!(instance_id = %id, "removed instance after {:?} without heartbeat", remove_after);
            self.audit.record(AuditEvent::new(AuditCategory::Registry, "expired", &id));
            report.removed.push(id);
        }

        if !report.is_empty() {
            self.publish();
        }
        report.generation = self.generation;
        report
    }

    /// Isolates an instance after a circuit breaker trip.
    pub fn mark_degraded(&mut self, instance_id: &InstanceId, until: Instant) -> bool {
        let Some(instance) = self.instances.get_mut(instance_id) else {
            return false;
        };
        let transition = instance.isolate(until);
        if transition.changed() {
            self.record_health(instance_id, transition, "circuit_breaker");
            self.publish();
        }
        true
    }

    fn record_health(&self, instance_id: &InstanceId, transition: HealthTransition, cause: &str) {
        if transition.to == HealthStatus::Unhealthy || cause == "circuit_breaker" {
            warn!(
                instance_id = %instance_id,
                "health {} -> {} ({})",
                transition.from,
                transition.to,
                cause
            );
        } else {
            debug!(instance_id = %instance_id, "health {} -> {} ({})", transition.from, transition.to, cause);
        }
        self.audit.record(
            AuditEvent::new(AuditCategory::Registry, "health_changed", instance_id).with_detail(json!({
                "from": transition.from,
                "to": transition.to,
                "cause": cause,
            })),
        );
    }

    fn apply(&mut self, command: RegistryCommand, now: Instant) {
        // A dropped reply receiver only means the caller gave up.
        match command {
            RegistryCommand::Register { request, reply } => {
                let _ = reply.send(self.register(request, now));
            }
            RegistryCommand::Heartbeat {
                instance_id,
                load,
                custom_metrics,
                reply,
            } => {
                let _ = reply.send(self.heartbeat(&instance_id, load, custom_metrics, now));
            }
            RegistryCommand::Unregister { instance_id, reply } => {
                let _ = reply.send(self.unregister(&instance_id, now));
            }
            RegistryCommand::Get { instance_id, reply } => {
                let _ = reply.send(self.get(&instance_id, now));
            }
            RegistryCommand::List { filter, reply } => {
                let _ = reply.send(self.list(&filter, now));
            }
            RegistryCommand::UpdateRoutes { routes, reply } => {
                let _ = reply.send(self.update_routes(routes));
            }
            RegistryCommand::Rebuild { reply } => {
                let _ = reply.send(self.rebuild());
            }
            RegistryCommand::Sweep { reply } => {
                let _ = reply.send(self.sweep(now));
            }
            RegistryCommand::MarkDegraded { instance_id, until } => {
                self.mark_degraded(&instance_id, until);
            }
        }
    }
}

enum RegistryCommand {
    Register {
        request: RegisterModuleRequest,
        reply: oneshot::Sender<Result<RegisterOutcome>>,
    },
    Heartbeat {
        instance_id: InstanceId,
        load: f64,
        custom_metrics: HashMap<String, f64>,
        reply: oneshot::Sender<Result<HeartbeatAck>>,
    },
    Unregister {
        instance_id: InstanceId,
        reply: oneshot::Sender<Result<ModuleInstanceInfo>>,
    },
    Get {
        instance_id: InstanceId,
        reply: oneshot::Sender<Result<ModuleInstanceInfo>>,
    },
    List {
        filter: ModuleFilter,
        reply: oneshot::Sender<Vec<ModuleInstanceInfo>>,
    },
    UpdateRoutes {
        routes: Vec<Route>,
        reply: oneshot::Sender<Result<u64>>,
    },
    Rebuild {
        reply: oneshot::Sender<u64>,
    },
    Sweep {
        reply: oneshot::Sender<SweepReport>,
    },
    MarkDegraded {
        instance_id: InstanceId,
        until: Instant,
    },
}

/// Cloneable front end of the registry writer.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
    snapshots: SnapshotCell,
}

impl RegistryHandle {
    /// Current routing snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshots.load()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).await.map_err(|_| SwitchyardError::Shutdown)?;
        rx.await.map_err(|_| SwitchyardError::Shutdown)
    }

    /// Like [`Self::request`] but sheds load instead of waiting for queue space.
    async fn offer<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.try_send(command(reply)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SwitchyardError::Overloaded("registry queue is full".into()),
            mpsc::error::TrySendError::Closed(_) => SwitchyardError::Shutdown,
        })?;
        rx.await.map_err(|_| SwitchyardError::Shutdown)
    }

    pub async fn register(&self, request: RegisterModuleRequest) -> Result<RegisterOutcome> {
        self.offer(|reply| RegistryCommand::Register { request, reply }).await?
    }

    pub async fn heartbeat(
        &self,
        instance_id: InstanceId,
        load: f64,
        custom_metrics: HashMap<String, f64>,
    ) -> Result<HeartbeatAck> {
        self.offer(|reply| RegistryCommand::Heartbeat {
            instance_id,
            load,
            custom_metrics,
            reply,
        })
        .await?
    }

    pub async fn unregister(&self, instance_id: InstanceId) -> Result<ModuleInstanceInfo> {
        self.request(|reply| RegistryCommand::Unregister { instance_id, reply }).await?
    }

    pub async fn get(&self, instance_id: InstanceId) -> Result<ModuleInstanceInfo> {
        self.request(|reply| RegistryCommand::Get { instance_id, reply }).await?
    }

    pub async fn list(&self, filter: ModuleFilter) -> Result<Vec<ModuleInstanceInfo>> {
        self.request(|reply| RegistryCommand::List { filter, reply }).await
    }

    pub async fn update_routes(&self, routes: Vec<Route>) -> Result<u64> {
        self.request(|reply| RegistryCommand::UpdateRoutes { routes, reply }).await?
    }

    pub async fn rebuild(&self) -> Result<u64> {
        self.request(|reply| RegistryCommand::Rebuild { reply }).await
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.request(|reply| RegistryCommand::Sweep { reply }).await
    }

    /// Fire-and-forget isolation request from the routing path.
    pub fn mark_degraded(&self, instance_id: InstanceId, until: Instant) {
        if let Err(e) = self.tx.try_send(RegistryCommand::MarkDegraded {
            instance_id: instance_id.clone(),
            until,
        }) {
            warn!(instance_id = %instance_id, "could not queue isolation: {}", e);
        }
    }
}

/// Starts the writer task.
pub fn spawn_registry(state: RegistryState, queue_capacity: usize) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(queue_capacity.max(1));
    let handle = RegistryHandle {
        tx,
        snapshots: state.snapshots(),
    };
    let task = tokio::spawn(async move {
        let mut state = state;
        while let Some(command) = rx.recv().await {
            state.apply(command, Instant::now());
        }
        info!("registry writer stopped");
    });
    (handle, task)
}
