//! Scaling Controller
//!
//! One state machine per module type with a policy:
//!
//! ```text
//! Stable -> ScalingUp   -> Cooldown -> Stable
//! Stable -> ScalingDown -> Cooldown -> Stable
//! ```
//!
//! Each unit has its own lock and at most one scale command in flight.
//! The periodic loop evaluates every unit independently, so a slow command
//! for one type never delays another.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use switchyard_common::methods::TriggerScalingResult;
use switchyard_common::{
    unix_millis, ModuleClient, ModuleType, Result, ScalingEvent, ScalingEventKind, ScalingPhase, ScalingPolicy,
    ScalingStatus, SwitchyardError,
};
use switchyard_metrics::{MetricsRegistry, MetricsSink};

use crate::audit::{AuditCategory, AuditEvent, AuditSink};
use crate::config::ScalingConfig;
use crate::retry::RetryConfig;
use crate::snapshot::SnapshotCell;

#[derive(Debug)]
struct UnitState {
    policy: ScalingPolicy,
    phase: ScalingPhase,
    replica_count: Option<u32>,
    above_since: Option<Instant>,
    below_since: Option<Instant>,
    cooldown_until: Option<Instant>,
    /// Set once a limit episode has been reported; cleared when the trigger stops holding.
    limit_reported: bool,
    alert: Option<String>,
    history: VecDeque<ScalingEvent>,
}

impl UnitState {
    fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            phase: ScalingPhase::Stable,
            replica_count: None,
            above_since: None,
            below_since: None,
            cooldown_until: None,
            limit_reported: false,
            alert: None,
            history: VecDeque::new(),
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }

    fn reset_windows(&mut self) {
        self.above_since = None;
        self.below_since = None;
    }
}

struct ScalingUnit {
    state: Arc<Mutex<UnitState>>,
    busy: AtomicBool,
}

/// Clears the busy flag on drop.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A scale action about to be sent.
struct Action {
    target: u32,
    kind: ScalingEventKind,
    manual: bool,
    metric_value: Option<f64>,
}

pub struct ScalingController {
    config: ScalingConfig,
    retry: RetryConfig,
    snapshots: SnapshotCell,
    metrics: Arc<MetricsRegistry>,
    modules: Arc<dyn ModuleClient>,
    sink: Arc<dyn MetricsSink>,
    audit: Arc<dyn AuditSink>,
    units: DashMap<ModuleType, Arc<ScalingUnit>>,
}

impl ScalingController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ScalingConfig,
        retry: RetryConfig,
        snapshots: SnapshotCell,
        metrics: Arc<MetricsRegistry>,
        modules: Arc<dyn ModuleClient>,
        sink: Arc<dyn MetricsSink>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            retry,
            snapshots,
            metrics,
            modules,
            sink,
            audit,
            units: DashMap::new(),
        }
    }

    fn unit(&self, module_type: ModuleType) -> Result<Arc<ScalingUnit>> {
        self.units
            .get(&module_type)
            .map(|u| Arc::clone(u.value()))
            .ok_or_else(|| SwitchyardError::NotFound(format!("no scaling policy for {}", module_type)))
    }

    /// Installs or replaces the policy for a module type.
    ///
    /// Sustained windows restart; cooldown and history are kept.
    pub async fn set_policy(&self, policy: ScalingPolicy) -> Result<()> {
        policy.validate()?;
        let module_type = policy.module_type;

        let existing = self.units.get(&module_type).map(|u| Arc::clone(u.value()));
        match existing {
            Some(unit) => {
                let mut state = unit.state.lock().await;
                state.policy = policy.clone();
                state.reset_windows();
                state.limit_reported = false;
            }
            None => {
                self.units.insert(
                    module_type,
                    Arc::new(ScalingUnit {
                        state: Arc::new(Mutex::new(UnitState::new(policy.clone()))),
                        busy: AtomicBool::new(false),
                    }),
                );
            }
        }

        info!(
            module_type = %module_type,
            min = policy.min_replicas,
            max = policy.max_replicas,
            "scaling policy set"
        );
        self.audit.record(
            AuditEvent::new(AuditCategory::Scaling, "policy_set", module_type)
                .with_detail(serde_json::to_value(&policy).unwrap_or_default()),
        );
        Ok(())
    }

    pub async fn policies(&self) -> Vec<ScalingPolicy> {
        let mut policies = Vec::new();
        for (_, unit) in self.sorted_units() {
            policies.push(unit.state.lock().await.policy.clone());
        }
        policies
    }

    fn sorted_units(&self) -> Vec<(ModuleType, Arc<ScalingUnit>)> {
        let mut units: Vec<_> = self.units.iter().map(|e| (*e.key(), Arc::clone(e.value()))).collect();
        units.sort_by_key(|(t, _)| *t);
        units
    }

    pub fn in_flight(&self, module_type: ModuleType) -> bool {
        self.units
            .get(&module_type)
            .map(|u| u.busy.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub async fn status(&self, module_type: ModuleType) -> Result<ScalingStatus> {
        let unit = self.unit(module_type)?;
        let state = unit.state.lock().await;
        Ok(status_of(module_type, &state, Instant::now()))
    }

    pub async fn statuses(&self) -> Vec<ScalingStatus> {
        let now = Instant::now();
        let mut statuses = Vec::new();
        for (module_type, unit) in self.sorted_units() {
            let state = unit.state.lock().await;
            statuses.push(status_of(module_type, &state, now));
        }
        statuses
    }

    /// Most recent events across all module types, oldest first.
    pub async fn history(&self) -> Vec<ScalingEvent> {
        let mut events = Vec::new();
        for (_, unit) in self.sorted_units() {
            events.extend(unit.state.lock().await.history.iter().cloned());
        }
        events.sort_by_key(|e| e.at_ms);
        let excess = events.len().saturating_sub(self.config.history_limit);
        events.drain(..excess);
        events
    }

    /// Manual override: scales by `delta` regardless of triggers and cooldown.
    pub async fn trigger_scaling(&self, module_type: ModuleType, delta: i32) -> Result<TriggerScalingResult> {
        let unit = self.unit(module_type)?;
        if delta == 0 {
            return Err(SwitchyardError::InvalidRequest("delta must be non-zero".into()));
        }
        if unit.busy.load(Ordering::Acquire) {
            return Err(SwitchyardError::ScalingInProgress(module_type));
        }

        let mut state = unit.state.lock().await;
        let now = Instant::now();
        let current = self.replicas(module_type, &mut state);
        let target = i64::from(current) + i64::from(delta);
        let (min, max) = (state.policy.min_replicas, state.policy.max_replicas);

        if target < i64::from(min) || target > i64::from(max) {
            self.record(
                &mut state,
                ScalingEvent {
                    at_ms: unix_millis(),
                    module_type,
                    kind: ScalingEventKind::LimitReached,
                    from_replicas: current,
                    to_replicas: current,
                    manual: true,
                    metric_value: None,
                    detail: Some(format!("requested {} outside [{}, {}]", target, min, max)),
                },
            );
            return Err(SwitchyardError::ScalingLimitReached {
                module_type,
                target,
                min,
                max,
            });
        }

        let action = Action {
            target: target as u32,
            kind: if delta > 0 {
                ScalingEventKind::ScaledUp
            } else {
                ScalingEventKind::ScaledDown
            },
            manual: true,
            metric_value: None,
        };
        let to = self.execute(module_type, &unit, &mut state, action, now).await?;
        Ok(TriggerScalingResult {
            from_replicas: current,
            to_replicas: to,
        })
    }

    /// Evaluates every unit once. The background loop does the same with
    /// each unit on its own task.
    pub async fn tick(&self, now: Instant) {
        for (module_type, unit) in self.sorted_units() {
            let mut state = unit.state.lock().await;
            self.evaluate(module_type, &unit, &mut state, now).await;
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(controller.config.tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let now = Instant::now();
                for (module_type, unit) in controller.sorted_units() {
                    // a unit still busy with the previous tick is skipped
                    let Ok(guard) = Arc::clone(&unit.state).try_lock_owned() else {
                        continue;
                    };
                    let controller = Arc::clone(&controller);
                    tokio::spawn(async move {
                        controller.evaluate_owned(module_type, unit, guard, now).await;
                    });
                }
            }
        })
    }

    async fn evaluate_owned(
        &self,
        module_type: ModuleType,
        unit: Arc<ScalingUnit>,
        mut guard: OwnedMutexGuard<UnitState>,
        now: Instant,
    ) {
        self.evaluate(module_type, &unit, &mut guard, now).await;
    }

    /// Current replica count, resynchronised from the registry while Stable.
    fn replicas(&self, module_type: ModuleType, state: &mut UnitState) -> u32 {
        match state.replica_count {
            Some(count) => count,
            None => {
                let count = self.snapshots.load().registered_count(module_type) as u32;
                state.replica_count = Some(count);
                count
            }
        }
    }

    async fn evaluate(&self, module_type: ModuleType, unit: &ScalingUnit, state: &mut UnitState, now: Instant) {
        if state.phase == ScalingPhase::Cooldown && !state.in_cooldown(now) {
            state.phase = ScalingPhase::Stable;
            state.cooldown_until = None;
            state.replica_count = None;
            debug!(module_type = %module_type, "scaling cooldown over");
        }

        let healthy = self.snapshots.load().healthy_ids(module_type);
        let up = self.metrics.average(&healthy, &state.policy.scale_up.metric);
        let down = self.metrics.average(&healthy, &state.policy.scale_down.metric);

        match up {
            Some(v) if v > state.policy.scale_up.threshold => {
                state.above_since.get_or_insert(now);
            }
            _ => {
                state.above_since = None;
                state.limit_reported = false;
            }
        }
        match down {
            Some(v) if v < state.policy.scale_down.threshold => {
                state.below_since.get_or_insert(now);
            }
            _ => state.below_since = None,
        }

        if state.phase != ScalingPhase::Stable {
            return;
        }

        let held = |since: Option<Instant>, window: Duration| since.map(|s| now.duration_since(s) >= window).unwrap_or(false);
        let current = self.replicas(module_type, state);
        let (min, max, step) = (state.policy.min_replicas, state.policy.max_replicas, state.policy.step);

        // A fleet outside the bounds (policy tightened, instances joined
        // out of band) is brought back to the nearest bound first.
        if (current > max || current < min) && !healthy.is_empty() {
            let target = current.clamp(min, max);
            info!(module_type = %module_type, replicas = current, "replica count outside [{}, {}], moving to {}", min, max, target);
            let action = Action {
                target,
                kind: if current > max {
                    ScalingEventKind::ScaledDown
                } else {
                    ScalingEventKind::ScaledUp
                },
                manual: false,
                metric_value: None,
            };
            let _ = self.execute(module_type, unit, state, action, now).await;
            return;
        }

        if held(state.above_since, state.policy.scale_up.sustained_window()) {
            if current >= max {
                if !state.limit_reported {
                    state.limit_reported = true;
                    warn!(module_type = %module_type, replicas = current, "sustained load at max_replicas {}", max);
                    self.sink
                        .alert(module_type, &format!("sustained load with {} replicas at max_replicas", current));
                    self.record(
                        state,
                        ScalingEvent {
                            at_ms: unix_millis(),
                            module_type,
                            kind: ScalingEventKind::LimitReached,
                            from_replicas: current,
                            to_replicas: current,
                            manual: false,
                            metric_value: up,
                            detail: Some(
                                SwitchyardError::ScalingLimitReached {
                                    module_type,
                                    target: i64::from(current) + i64::from(step),
                                    min,
                                    max,
                                }
                                .to_string(),
                            ),
                        },
                    );
                }
                return;
            }
            let action = Action {
                target: current.saturating_add(step).clamp(min, max),
                kind: ScalingEventKind::ScaledUp,
                manual: false,
                metric_value: up,
            };
            let _ = self.execute(module_type, unit, state, action, now).await;
        } else if held(state.below_since, state.policy.scale_down.sustained_window()) && current > min {
            let action = Action {
                target: current.saturating_sub(step).clamp(min, max),
                kind: ScalingEventKind::ScaledDown,
                manual: false,
                metric_value: down,
            };
            let _ = self.execute(module_type, unit, state, action, now).await;
        }
    }

    /// Sends the scale command, rotating through Healthy instances on failure.
    async fn execute(
        &self,
        module_type: ModuleType,
        unit: &ScalingUnit,
        state: &mut UnitState,
        action: Action,
        now: Instant,
    ) -> Result<u32> {
        if unit
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SwitchyardError::ScalingInProgress(module_type));
        }
        let _in_flight = InFlight(&unit.busy);

        let from = self.replicas(module_type, state);
        state.phase = match action.kind {
            ScalingEventKind::ScaledDown => ScalingPhase::ScalingDown,
            _ => ScalingPhase::ScalingUp,
        };

        let addresses: Vec<String> = self
            .snapshots
            .load()
            .healthy(module_type)
            .iter()
            .map(|i| i.address.clone())
            .collect();
        let deadline = self.config.command_timeout();
        let attempts = self.config.command_retries.max(1);
        let mut last_error = SwitchyardError::Unhealthy(format!("no healthy {} instance to command", module_type));

        if !addresses.is_empty() {
            for attempt in 0..attempts {
                if attempt > 0 {
                    tokio::time::sleep(self.retry.backoff(attempt - 1)).await;
                }
                let address = &addresses[attempt as usize % addresses.len()];
                let result = match tokio::time::timeout(deadline, self.modules.scale(address, action.target, deadline)).await {
                    Ok(result) => result,
                    Err(_) => Err(SwitchyardError::Timeout(deadline.as_millis() as u64)),
                };
                match result {
                    Ok(ack) if ack.accepted => {
                        state.replica_count = Some(action.target);
                        state.alert = None;
                        self.enter_cooldown(state, now);
                        info!(
                            module_type = %module_type,
                            manual = action.manual,
                            "scaled {} -> {} replicas via {}",
                            from,
                            action.target,
                            address
                        );
                        self.record(
                            state,
                            ScalingEvent {
                                at_ms: unix_millis(),
                                module_type,
                                kind: action.kind,
                                from_replicas: from,
                                to_replicas: action.target,
                                manual: action.manual,
                                metric_value: action.metric_value,
                                detail: None,
                            },
                        );
                        return Ok(action.target);
                    }
                    Ok(_) => {
                        debug!(module_type = %module_type, address = %address, "scale command rejected");
                        last_error = SwitchyardError::Unhealthy(format!("{} rejected scale to {}", address, action.target));
                    }
                    Err(e) => {
                        debug!(module_type = %module_type, address = %address, "scale command failed: {}", e);
                        last_error = e;
                    }
                }
            }
        }

        let message = format!(
            "scale {} -> {} failed after {} attempts: {}",
            from, action.target, attempts, last_error
        );
        warn!(module_type = %module_type, "{}", message);
        self.sink.alert(module_type, &message);
        state.alert = Some(message.clone());
        self.enter_cooldown(state, now);
        self.record(
            state,
            ScalingEvent {
                at_ms: unix_millis(),
                module_type,
                kind: ScalingEventKind::CommandFailed,
                from_replicas: from,
                to_replicas: action.target,
                manual: action.manual,
                metric_value: action.metric_value,
                detail: Some(message),
            },
        );
        Err(last_error)
    }

    fn enter_cooldown(&self, state: &mut UnitState, now: Instant) {
        state.phase = ScalingPhase::Cooldown;
        state.cooldown_until = Some(now + state.policy.cooldown());
        state.reset_windows();
    }

    fn record(&self, state: &mut UnitState, event: ScalingEvent) {
        self.audit.record(
            AuditEvent::new(AuditCategory::Scaling, event_action(event.kind), event.module_type)
                .with_detail(serde_json::to_value(&event).unwrap_or_default()),
        );
        state.history.push_back(event);
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
    }
}

fn event_action(kind: ScalingEventKind) -> &'static str {
    match kind {
        ScalingEventKind::ScaledUp => "scaled_up",
        ScalingEventKind::ScaledDown => "scaled_down",
        ScalingEventKind::LimitReached => "limit_reached",
        ScalingEventKind::CommandFailed => "command_failed",
    }
}

fn status_of(module_type: ModuleType, state: &UnitState, now: Instant) -> ScalingStatus {
    ScalingStatus {
        module_type,
        policy: state.policy.clone(),
        phase: state.phase,
        replica_count: state.replica_count,
        cooldown_remaining_ms: state
            .cooldown_until
            .map(|until| until.saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0),
        alert: state.alert.clone(),
        history: state.history.iter().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::HeartbeatConfig;
    use crate::entitlement::StaticEntitlements;
    use crate::registry::{spawn_registry, RegistryHandle, RegistryState};
    use crate::testing::MockModuleClient;
    use std::collections::HashMap;
    use switchyard_common::{InstanceId, RegisterModuleRequest};
    use switchyard_metrics::MemoryMetricsSink;

    const IB: ModuleType = ModuleType::InferenceBalancer;

    struct Fixture {
        controller: Arc<ScalingController>,
        registry: RegistryHandle,
        metrics: Arc<MetricsRegistry>,
        modules: Arc<MockModuleClient>,
        sink: Arc<MemoryMetricsSink>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(MemoryAuditSink::default());
        let state = RegistryState::new(
            HeartbeatConfig::default(),
            Vec::new(),
            0,
            Arc::new(StaticEntitlements::unlimited()),
            audit.clone(),
        );
        let snapshots = state.snapshots();
        let (registry, _task) = spawn_registry(state, 64);
        let metrics = Arc::new(MetricsRegistry::new());
        let modules = Arc::new(MockModuleClient::new());
        let sink = Arc::new(MemoryMetricsSink::new());
        let controller = Arc::new(ScalingController::new(
            ScalingConfig::default(),
            RetryConfig::default(),
            snapshots,
            metrics.clone(),
            modules.clone(),
            sink.clone(),
            audit.clone(),
        ));
        Fixture {
            controller,
            registry,
            metrics,
            modules,
            sink,
            audit,
        }
    }

    /// Registers `n` Healthy instances reporting `load`; addresses are `ib-{i}:7000`.
    async fn fleet(f: &Fixture, n: usize, load: f64) -> Vec<InstanceId> {
        let mut ids = Vec::new();
        for i in 0..n {
            let id = f
                .registry
                .register(RegisterModuleRequest {
                    instance_id: None,
                    module_type: IB,
                    address: format!("ib-{}:7000", i),
                    capabilities: Vec::new(),
                    version: "v1".into(),
                })
                .await
                .unwrap()
                .instance_id;
            f.registry.heartbeat(id.clone(), load, HashMap::new()).await.unwrap();
            f.metrics.record_sample(&id, IB, load, HashMap::new());
            ids.push(id);
        }
        ids
    }

    fn policy(min: u32, max: u32) -> ScalingPolicy {
        ScalingPolicy::load_based(IB, min, max)
    }

    #[tokio::test]
    async fn test_scenario_d_limit_reached_at_max() {
        let f = fixture();
        fleet(&f, 3, 0.9).await;
        f.controller.set_policy(policy(1, 3)).await.unwrap();

        let t0 = Instant::now();
        f.controller.tick(t0).await;
        f.controller.tick(t0 + Duration::from_secs(31)).await;
        f.controller.tick(t0 + Duration::from_secs(45)).await;

        assert!(f.modules.scale_calls().is_empty());
        let status = f.controller.status(IB).await.unwrap();
        assert_eq!(status.phase, ScalingPhase::Stable);
        assert_eq!(status.replica_count, Some(3));
        // reported once per episode
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].kind, ScalingEventKind::LimitReached);
        assert_eq!(f.sink.alerts().len(), 1);

        let err = f.controller.trigger_scaling(IB, 1).await.unwrap_err();
        assert!(matches!(
            err,
            SwitchyardError::ScalingLimitReached { target: 4, min: 1, max: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_scale_up_after_sustained_window_then_cooldown() {
        let f = fixture();
        let ids = fleet(&f, 2, 0.9).await;
        f.controller.set_policy(policy(1, 5)).await.unwrap();

        let t0 = Instant::now();
        f.controller.tick(t0).await;
        f.controller.tick(t0 + Duration::from_secs(20)).await;
        assert!(f.modules.scale_calls().is_empty());

        f.controller.tick(t0 + Duration::from_secs(30)).await;
        assert_eq!(f.modules.scale_calls(), vec![("ib-0:7000".to_string(), 3)]);
        let status = f.controller.status(IB).await.unwrap();
        assert_eq!(status.phase, ScalingPhase::Cooldown);
        assert_eq!(status.replica_count, Some(3));
        assert_eq!(status.history[0].kind, ScalingEventKind::ScaledUp);
        assert_eq!(status.history[0].metric_value, Some(0.9));

        // still hot, but cooling down
        f.controller.tick(t0 + Duration::from_secs(60)).await;
        f.controller.tick(t0 + Duration::from_secs(80)).await;
        assert_eq!(f.modules.scale_calls().len(), 1);

        for id in &ids {
            f.metrics.record_sample(id, IB, 0.5, HashMap::new());
        }
        f.controller.tick(t0 + Duration::from_secs(91)).await;
        let status = f.controller.status(IB).await.unwrap();
        assert_eq!(status.phase, ScalingPhase::Stable);
        assert_eq!(status.cooldown_remaining_ms, 0);
        assert_eq!(f.modules.scale_calls().len(), 1);
        // policy_set + scaled_up
        assert_eq!(f.audit.by_category(AuditCategory::Scaling).len(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_needs_longer_window() {
        let f = fixture();
        fleet(&f, 2, 0.1).await;
        f.controller.set_policy(policy(1, 5)).await.unwrap();

        let t0 = Instant::now();
        f.controller.tick(t0).await;
        f.controller.tick(t0 + Duration::from_secs(120)).await;
        assert!(f.modules.scale_calls().is_empty());

        f.controller.tick(t0 + Duration::from_secs(300)).await;
        assert_eq!(f.modules.scale_calls(), vec![("ib-0:7000".to_string(), 1)]);
        let status = f.controller.status(IB).await.unwrap();
        assert_eq!(status.replica_count, Some(1));
        assert_eq!(status.history[0].kind, ScalingEventKind::ScaledDown);
    }

    #[tokio::test]
    async fn test_fleet_above_max_is_brought_down_to_max() {
        let f = fixture();
        fleet(&f, 5, 0.1).await;
        f.controller.set_policy(policy(1, 3)).await.unwrap();

        let t0 = Instant::now();
        f.controller.tick(t0).await;
        assert_eq!(f.modules.scale_calls(), vec![("ib-0:7000".to_string(), 3)]);
        let status = f.controller.status(IB).await.unwrap();
        assert_eq!(status.replica_count, Some(3));
        assert_eq!(status.history[0].kind, ScalingEventKind::ScaledDown);

        // the registry still lists five once the cooldown resyncs the count
        f.controller.tick(t0 + Duration::from_secs(61)).await;
        f.controller.tick(t0 + Duration::from_secs(400)).await;
        for (_, target) in f.modules.scale_calls() {
            assert!((1..=3).contains(&target), "target {} outside [1, 3]", target);
        }
    }

    #[tokio::test]
    async fn test_fleet_below_min_is_brought_up_to_min() {
        let f = fixture();
        fleet(&f, 1, 0.5).await;
        f.controller.set_policy(policy(3, 6)).await.unwrap();

        f.controller.tick(Instant::now()).await;
        assert_eq!(f.modules.scale_calls(), vec![("ib-0:7000".to_string(), 3)]);
        let status = f.controller.status(IB).await.unwrap();
        assert_eq!(status.replica_count, Some(3));
        assert_eq!(status.history[0].kind, ScalingEventKind::ScaledUp);
    }

    #[tokio::test]
    async fn test_empty_fleet_is_not_commanded() {
        let f = fixture();
        f.controller.set_policy(policy(2, 4)).await.unwrap();
        f.controller.tick(Instant::now()).await;
        assert!(f.modules.scale_calls().is_empty());
        assert!(f.sink.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_idle_fleet_at_min_stays_put() {
        let f = fixture();
        fleet(&f, 1, 0.05).await;
        f.controller.set_policy(policy(1, 5)).await.unwrap();

        let t0 = Instant::now();
        for secs in [0, 300, 600, 900] {
            f.controller.tick(t0 + Duration::from_secs(secs)).await;
        }
        assert!(f.modules.scale_calls().is_empty());
        let status = f.controller.status(IB).await.unwrap();
        assert_eq!(status.phase, ScalingPhase::Stable);
        assert!(status.history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_rotates_then_alerts() {
        let f = fixture();
        fleet(&f, 2, 0.5).await;
        f.controller.set_policy(policy(1, 5)).await.unwrap();

        f.modules.reject_scale("ib-0:7000");
        let result = f.controller.trigger_scaling(IB, 1).await.unwrap();
        assert_eq!((result.from_replicas, result.to_replicas), (2, 3));
        assert_eq!(
            f.modules.scale_calls(),
            vec![("ib-0:7000".to_string(), 3), ("ib-1:7000".to_string(), 3)]
        );

        f.modules.refuse("ib-0:7000");
        f.modules.refuse("ib-1:7000");
        let err = f.controller.trigger_scaling(IB, 1).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Transport(_)));

        let status = f.controller.status(IB).await.unwrap();
        assert_eq!(status.replica_count, Some(3));
        assert!(status.alert.is_some());
        assert_eq!(status.phase, ScalingPhase::Cooldown);
        assert_eq!(status.history.last().unwrap().kind, ScalingEventKind::CommandFailed);
        assert_eq!(f.sink.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_validation() {
        let f = fixture();
        assert!(matches!(
            f.controller.trigger_scaling(IB, 1).await,
            Err(SwitchyardError::NotFound(_))
        ));

        fleet(&f, 2, 0.5).await;
        f.controller.set_policy(policy(1, 4)).await.unwrap();
        assert!(matches!(
            f.controller.trigger_scaling(IB, 0).await,
            Err(SwitchyardError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.controller.trigger_scaling(IB, -2).await,
            Err(SwitchyardError::ScalingLimitReached { target: 0, .. })
        ));
        let result = f.controller.trigger_scaling(IB, 2).await.unwrap();
        assert_eq!(result.to_replicas, 4);

        let mut bad = policy(1, 4);
        bad.min_replicas = 9;
        assert!(matches!(
            f.controller.set_policy(bad).await,
            Err(SwitchyardError::InvalidPolicy(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_command_in_flight_per_type() {
        let f = fixture();
        fleet(&f, 1, 0.5).await;
        f.controller.set_policy(policy(1, 5)).await.unwrap();
        f.modules.hang("ib-0:7000");

        let controller = f.controller.clone();
        let first = tokio::spawn(async move { controller.trigger_scaling(IB, 1).await });
        for _ in 0..10 {
            if f.controller.in_flight(IB) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(f.controller.in_flight(IB));
        assert!(matches!(
            f.controller.trigger_scaling(IB, 1).await,
            Err(SwitchyardError::ScalingInProgress(IB))
        ));

        assert!(matches!(first.await.unwrap(), Err(SwitchyardError::Timeout(_))));
        assert!(!f.controller.in_flight(IB));
    }

    #[tokio::test]
    async fn test_custom_metric_policy() {
        let f = fixture();
        let ids = fleet(&f, 2, 0.2).await;
        for id in &ids {
            let mut custom = HashMap::new();
            custom.insert("gpu_queue".to_string(), 40.0);
            f.metrics.merge_custom(id, custom);
        }
        let mut p = policy(1, 5);
        p.scale_up.metric = "gpu_queue".into();
        p.scale_up.threshold = 32.0;
        f.controller.set_policy(p).await.unwrap();

        let t0 = Instant::now();
        f.controller.tick(t0).await;
        f.controller.tick(t0 + Duration::from_secs(30)).await;
        assert_eq!(f.modules.scale_calls(), vec![("ib-0:7000".to_string(), 3)]);
    }
}
