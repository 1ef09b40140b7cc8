//! Blue/green Deployment Orchestrator.
//!
//! Each module type owns one slot: the published [`DeploymentState`] behind
//! an `ArcSwap` (read once per routing decision, never locked) and a
//! per-type async mutex that serialises transitions. Transitions on one
//! type never wait on another type.
//!
//! A transition is committed by swapping the whole record before the call
//! returns, then pushed to the type's Healthy instances on a best-effort
//! basis.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchyard_common::{
    unix_millis, DeploymentInfo, DeploymentPhase, DeploymentState, DeploymentTransition, ModuleClient, ModuleType,
    PromotionStrategy, Result, SwitchyardError,
};

use crate::audit::{AuditCategory, AuditEvent, AuditSink};
use crate::config::DeploymentConfig;
use crate::snapshot::SnapshotCell;

#[derive(Debug, Default)]
struct SlotInner {
    history: VecDeque<DeploymentTransition>,
    next_step_at: Option<Instant>,
    retire_at: Option<Instant>,
}

struct DeploymentSlot {
    current: ArcSwap<DeploymentState>,
    inner: Mutex<SlotInner>,
}

impl DeploymentSlot {
    fn new(state: DeploymentState) -> Self {
        Self {
            current: ArcSwap::from_pointee(state),
            inner: Mutex::new(SlotInner::default()),
        }
    }
}

pub struct DeploymentOrchestrator {
    config: DeploymentConfig,
    modules: Arc<dyn ModuleClient>,
    snapshots: SnapshotCell,
    audit: Arc<dyn AuditSink>,
    slots: DashMap<ModuleType, Arc<DeploymentSlot>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        config: DeploymentConfig,
        modules: Arc<dyn ModuleClient>,
        snapshots: SnapshotCell,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            modules,
            snapshots,
            audit,
            slots: DashMap::new(),
        }
    }

    /// Published record for a module type. Lock-free.
    pub fn current(&self, module_type: ModuleType) -> Option<Arc<DeploymentState>> {
        self.slots.get(&module_type).map(|slot| slot.current.load_full())
    }

    pub fn all(&self) -> Vec<DeploymentState> {
        let mut states: Vec<DeploymentState> = self
            .slots
            .iter()
            .map(|slot| (*slot.current.load_full()).clone())
            .collect();
        states.sort_by_key(|s| s.module_type);
        states
    }

    /// Creates the record for a type the first time one of its instances registers.
    pub fn ensure_initialized(&self, module_type: ModuleType, version: &str) -> bool {
        if self.slots.contains_key(&module_type) {
            return false;
        }
        let mut created = false;
        self.slots.entry(module_type).or_insert_with(|| {
            created = true;
            Arc::new(DeploymentSlot::new(DeploymentState::initial(module_type, version)))
        });
        if created {
            info!(module_type = %module_type, "deployment initialised with stable version {}", version);
            self.audit.record(
                AuditEvent::new(AuditCategory::Deployment, "initialized", module_type)
                    .with_detail(json!({ "stable_version": version })),
            );
        }
        created
    }

    /// Loads persisted records; an interrupted stepped promotion resumes on the next tick.
    pub async fn restore(&self, states: Vec<DeploymentState>) {
        for state in states {
            if state.check_weights().is_err() {
                warn!(module_type = %state.module_type, "ignoring persisted deployment with invalid weights");
                continue;
            }
            let module_type = state.module_type;
            let promoting = state.phase == DeploymentPhase::Promoting;
            let retiring = state.retiring_version.is_some();
            let slot = Arc::new(DeploymentSlot::new(state));
            {
                let mut inner = slot.inner.lock().await;
                let now = Instant::now();
                if promoting {
                    inner.next_step_at = Some(now);
                }
                if retiring {
                    inner.retire_at = Some(now + self.config.drain_timeout());
                }
            }
            self.slots.insert(module_type, slot);
        }
    }

    fn slot(&self, module_type: ModuleType) -> Result<Arc<DeploymentSlot>> {
        self.slots
            .get(&module_type)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| SwitchyardError::NotFound(format!("no deployment for {}", module_type)))
    }

    /// Runs one transition under the slot lock and commits it atomically.
    async fn transition<F>(&self, module_type: ModuleType, action: &str, apply: F) -> Result<DeploymentState>
    where
        F: FnOnce(&DeploymentState, &mut SlotInner, Instant) -> Result<DeploymentState>,
    {
        let slot = self.slot(module_type)?;
        let mut inner = slot.inner.lock().await;
        let now = Instant::now();
        self.commit(module_type, &slot, &mut inner, action, now, apply).await
    }

    async fn commit<F>(
        &self,
        module_type: ModuleType,
        slot: &DeploymentSlot,
        inner: &mut SlotInner,
        action: &str,
        now: Instant,
        apply: F,
    ) -> Result<DeploymentState>
    where
        F: FnOnce(&DeploymentState, &mut SlotInner, Instant) -> Result<DeploymentState>,
    {
        let before = slot.current.load_full();
        let mut after = apply(before.as_ref(), &mut *inner, now)?;
        after.check_weights()?;
        after.generation = before.generation + 1;
        after.updated_at_ms = unix_millis();
        slot.current.store(Arc::new(after.clone()));

        info!(
            module_type = %module_type,
            phase = ?after.phase,
            "{}: {} {}% / {} {}%",
            action,
            after.stable_version,
            after.traffic_weight_stable,
            after.candidate_version.as_deref().unwrap_or("-"),
            after.traffic_weight_candidate
        );
        self.audit.record(
            AuditEvent::new(AuditCategory::Deployment, action, module_type).with_detail(json!({
                "before": before.weights(),
                "after": after.weights(),
                "phase": after.phase,
            })),
        );
        if inner.history.len() >= self.config.history_limit.max(1) {
            inner.history.pop_front();
        }
        inner.history.push_back(DeploymentTransition {
            at_ms: after.updated_at_ms,
            action: action.to_string(),
            before: (*before).clone(),
            after: after.clone(),
        });

        self.push_weights(&after).await;
        Ok(after)
    }

    /// Sets one version's weight; the other version receives the remainder.
    ///
    /// A version that is neither stable nor candidate becomes the candidate
    /// and starts a canary. Without a candidate the stable weight must be 100.
    pub async fn set_traffic_weight(&self, module_type: ModuleType, version: &str, weight: u32) -> Result<DeploymentState> {
        self.transition(module_type, "set_traffic_weight", |before, _, _| {
            if weight > 100 {
                return Err(SwitchyardError::InvalidWeight {
                    stable: weight,
                    candidate: 0,
                });
            }
            let weight = weight as u8;
            let mut after = before.clone();
            if before.phase == DeploymentPhase::Promoting {
                return Err(SwitchyardError::InvalidRequest(format!(
                    "{} is being promoted; roll back first",
                    module_type
                )));
            }

            if version == before.stable_version {
                after.traffic_weight_stable = weight;
                after.traffic_weight_candidate = if after.candidate_version.is_some() { 100 - weight } else { 0 };
            } else {
                if before.candidate_version.as_deref() != Some(version) {
                    if before.candidate_version.is_some() && before.traffic_weight_candidate > 0 {
                        return Err(SwitchyardError::InvalidRequest(format!(
                            "candidate {} still receives traffic",
                            before.candidate_version.as_deref().unwrap_or_default()
                        )));
                    }
                    after.candidate_version = Some(version.to_string());
                }
                after.traffic_weight_candidate = weight;
                after.traffic_weight_stable = 100 - weight;
            }

            if after.candidate_version.is_some() && before.phase != DeploymentPhase::Canary {
                after.last_stable_snapshot = Some(before.weights());
                after.phase = DeploymentPhase::Canary;
            }
            after.promotion = None;
            Ok(after)
        })
        .await
    }

    /// Sets both weights explicitly; they must sum to 100.
    pub async fn set_traffic_split(&self, module_type: ModuleType, stable: u32, candidate: u32) -> Result<DeploymentState> {
        self.transition(module_type, "set_traffic_split", |before, _, _| {
            if stable + candidate != 100 || stable > 100 || candidate > 100 {
                return Err(SwitchyardError::InvalidWeight { stable, candidate });
            }
            if before.candidate_version.is_none() && candidate > 0 {
                return Err(SwitchyardError::NotFound(format!("no candidate version for {}", module_type)));
            }
            if before.phase == DeploymentPhase::Promoting {
                return Err(SwitchyardError::InvalidRequest(format!(
                    "{} is being promoted; roll back first",
                    module_type
                )));
            }
            let mut after = before.clone();
            after.traffic_weight_stable = stable as u8;
            after.traffic_weight_candidate = candidate as u8;
            if after.candidate_version.is_some() && before.phase != DeploymentPhase::Canary {
                after.last_stable_snapshot = Some(before.weights());
                after.phase = DeploymentPhase::Canary;
            }
            Ok(after)
        })
        .await
    }

    /// Moves all weight to the candidate, at once or in steps.
    pub async fn promote_version(
        &self,
        module_type: ModuleType,
        strategy: Option<PromotionStrategy>,
    ) -> Result<DeploymentState> {
        let strategy = strategy.unwrap_or_default();
        strategy.validate()?;
        let drain = self.config.drain_timeout();

        self.transition(module_type, "promote", move |before, inner, now| {
            if before.candidate_version.is_none() {
                return Err(SwitchyardError::NotFound(format!("no candidate version for {}", module_type)));
            }
            if before.phase == DeploymentPhase::Promoting {
                return Err(SwitchyardError::InvalidRequest(format!("{} is already being promoted", module_type)));
            }
            match strategy {
                PromotionStrategy::Stepped { step, .. } if before.traffic_weight_candidate < 100 => {
                    let mut after = before.clone();
                    if before.last_stable_snapshot.is_none() || before.phase != DeploymentPhase::Canary {
                        after.last_stable_snapshot = Some(before.weights());
                    }
                    let candidate = before.traffic_weight_candidate.saturating_add(step).min(100);
                    after.traffic_weight_candidate = candidate;
                    after.traffic_weight_stable = 100 - candidate;
                    after.phase = DeploymentPhase::Promoting;
                    after.promotion = Some(strategy);
                    if candidate == 100 {
                        return Ok(finalize(&after, inner, now, drain));
                    }
                    inner.next_step_at = strategy.interval().map(|i| now + i);
                    Ok(after)
                }
                _ => {
                    let mut staged = before.clone();
                    if staged.last_stable_snapshot.is_none() || before.phase != DeploymentPhase::Canary {
                        staged.last_stable_snapshot = Some(before.weights());
                    }
                    Ok(finalize(&staged, inner, now, drain))
                }
            }
        })
        .await
    }

    /// Restores the weights captured before the canary started.
    ///
    /// The rolled-back version stays as candidate at weight 0 until cleanup.
    pub async fn rollback(&self, module_type: ModuleType) -> Result<DeploymentState> {
        let after = self
            .transition(module_type, "rollback", |before, inner, _| {
                let snapshot = before
                    .last_stable_snapshot
                    .clone()
                    .ok_or_else(|| SwitchyardError::NotFound(format!("no stable snapshot for {}", module_type)))?;

                let rolled_back = if before.stable_version != snapshot.stable_version {
                    Some(before.stable_version.clone())
                } else {
                    before.candidate_version.clone()
                };
                let mut after = before.clone();
                after.stable_version = snapshot.stable_version.clone();
                after.candidate_version = snapshot.candidate_version.clone().or(rolled_back);
                after.traffic_weight_stable = snapshot.weight_stable;
                after.traffic_weight_candidate = snapshot.weight_candidate;
                after.phase = DeploymentPhase::RolledBack;
                after.promotion = None;
                after.retiring_version = None;
                inner.next_step_at = None;
                inner.retire_at = None;
                Ok(after)
            })
            .await?;

        let addresses = self.addresses(module_type);
        let deadline = self.config.push_timeout();
        let results = join_all(addresses.iter().map(|a| self.modules.rollback(a, deadline))).await;
        for (address, result) in addresses.iter().zip(results) {
            if let Err(e) = result {
                warn!(module_type = %module_type, "rollback on {} failed: {}", address, e);
            }
        }
        Ok(after)
    }

    /// Forgets the candidate and the rollback snapshot.
    pub async fn cleanup(&self, module_type: ModuleType) -> Result<DeploymentState> {
        self.transition(module_type, "cleanup", |before, inner, _| {
            if before.traffic_weight_candidate > 0 || before.phase == DeploymentPhase::Promoting {
                return Err(SwitchyardError::InvalidRequest(format!(
                    "candidate {} still receives traffic",
                    before.candidate_version.as_deref().unwrap_or_default()
                )));
            }
            let mut after = before.clone();
            after.candidate_version = None;
            after.traffic_weight_stable = 100;
            after.traffic_weight_candidate = 0;
            after.last_stable_snapshot = None;
            after.retiring_version = None;
            after.promotion = None;
            after.phase = DeploymentPhase::Idle;
            inner.retire_at = None;
            Ok(after)
        })
        .await
    }

    pub async fn info(&self, module_type: ModuleType) -> Result<DeploymentInfo> {
        let slot = self.slot(module_type)?;
        let inner = slot.inner.lock().await;
        Ok(DeploymentInfo {
            state: (*slot.current.load_full()).clone(),
            history: inner.history.iter().cloned().collect(),
        })
    }

    /// Advances stepped promotions and retires drained versions.
    pub async fn tick(&self, now: Instant) {
        let slots: Vec<(ModuleType, Arc<DeploymentSlot>)> =
            self.slots.iter().map(|e| (*e.key(), e.value().clone())).collect();

        for (module_type, slot) in slots {
            let mut inner = slot.inner.lock().await;

            if inner.next_step_at.map(|at| now >= at).unwrap_or(false) {
                let drain = self.config.drain_timeout();
                let result = self
                    .commit(module_type, &slot, &mut inner, "promotion_step", now, |before, inner, now| {
                        let step = match before.promotion {
                            Some(PromotionStrategy::Stepped { step, .. }) if before.phase == DeploymentPhase::Promoting => step,
                            _ => {
                                inner.next_step_at = None;
                                return Err(SwitchyardError::InvalidRequest("no promotion in progress".into()));
                            }
                        };
                        let mut after = before.clone();
                        let candidate = before.traffic_weight_candidate.saturating_add(step).min(100);
                        after.traffic_weight_candidate = candidate;
                        after.traffic_weight_stable = 100 - candidate;
                        if candidate == 100 {
                            return Ok(finalize(&after, inner, now, drain));
                        }
                        inner.next_step_at = before.promotion.and_then(|p| p.interval()).map(|i| now + i);
                        Ok(after)
                    })
                    .await;
                if let Err(e) = result {
                    debug!(module_type = %module_type, "promotion step skipped: {}", e);
                }
            }

            if inner.retire_at.map(|at| now >= at).unwrap_or(false) {
                let result = self
                    .commit(module_type, &slot, &mut inner, "retired", now, |before, inner, _| {
                        inner.retire_at = None;
                        let mut after = before.clone();
                        after.retiring_version = None;
                        Ok(after)
                    })
                    .await;
                if let Err(e) = result {
                    debug!(module_type = %module_type, "retirement skipped: {}", e);
                }
            }
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orchestrator.config.tick_interval());
            loop {
                interval.tick().await;
                orchestrator.tick(Instant::now()).await;
            }
        })
    }

    fn addresses(&self, module_type: ModuleType) -> Vec<String> {
        self.snapshots
            .load()
            .healthy(module_type)
            .iter()
            .map(|i| i.address.clone())
            .collect()
    }

    async fn push_weights(&self, state: &DeploymentState) {
        let mut weights = vec![(state.stable_version.clone(), state.traffic_weight_stable)];
        if let Some(candidate) = &state.candidate_version {
            weights.push((candidate.clone(), state.traffic_weight_candidate));
        }
        if let Some(retiring) = &state.retiring_version {
            weights.push((retiring.clone(), 0));
        }

        let deadline = self.config.push_timeout();
        let addresses = self.addresses(state.module_type);
        let pushes = addresses.iter().flat_map(|address| {
            weights.iter().map(move |(version, weight)| async move {
                let result = self.modules.set_traffic_weight(address, version, *weight, deadline).await;
                (address, result)
            })
        });
        for (address, result) in join_all(pushes).await {
            if let Err(e) = result {
                warn!(module_type = %state.module_type, "weight push to {} failed: {}", address, e);
            }
        }
    }
}

/// Candidate becomes stable; the old stable drains until retired.
fn finalize(state: &DeploymentState, inner: &mut SlotInner, now: Instant, drain: std::time::Duration) -> DeploymentState {
    let mut after = state.clone();
    let previous = state.stable_version.clone();
    if let Some(candidate) = state.candidate_version.clone() {
        after.stable_version = candidate;
    }
    after.candidate_version = None;
    after.traffic_weight_stable = 100;
    after.traffic_weight_candidate = 0;
    after.phase = DeploymentPhase::Idle;
    after.promotion = None;
    after.retiring_version = Some(previous);
    inner.next_step_at = None;
    inner.retire_at = Some(now + drain);
    after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::instance::ModuleInstance;
    use crate::snapshot::RoutingSnapshot;
    use crate::testing::MockModuleClient;
    use std::collections::HashMap;
    use std::time::Duration;
    use switchyard_common::{InstanceId, RegisterModuleRequest};

    const ALB: ModuleType = ModuleType::ApplicationBalancer;

    fn orchestrator() -> (DeploymentOrchestrator, Arc<MockModuleClient>, Arc<MemoryAuditSink>) {
        let modules = Arc::new(MockModuleClient::new());
        let audit = Arc::new(MemoryAuditSink::default());
        let o = DeploymentOrchestrator::new(
            DeploymentConfig::default(),
            modules.clone(),
            SnapshotCell::new(RoutingSnapshot::empty()),
            audit.clone(),
        );
        o.ensure_initialized(ALB, "v1");
        (o, modules, audit)
    }

    fn weights(s: &DeploymentState) -> (String, u8, Option<String>, u8) {
        (
            s.stable_version.clone(),
            s.traffic_weight_stable,
            s.candidate_version.clone(),
            s.traffic_weight_candidate,
        )
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_found() {
        let (o, _, _) = orchestrator();
        let err = o.set_traffic_weight(ModuleType::MediaBalancer, "v2", 10).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::NotFound(_)));
        assert!(matches!(o.rollback(ALB).await, Err(SwitchyardError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_scenario_c_weight_promote_rollback() {
        let (o, _, _) = orchestrator();

        let s = o.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        assert_eq!(s.phase, DeploymentPhase::Canary);
        assert_eq!(weights(&s), ("v1".into(), 90, Some("v2".into()), 10));

        let s = o.set_traffic_weight(ALB, "v1", 90).await.unwrap();
        assert_eq!(s.traffic_weight_stable + s.traffic_weight_candidate, 100);
        assert_eq!(s.weight_of("v2"), 10);

        let s = o.promote_version(ALB, None).await.unwrap();
        assert_eq!(s.weight_of("v2"), 100);
        assert_eq!(s.weight_of("v1"), 0);
        assert_eq!(s.stable_version, "v2");
        assert_eq!(s.retiring_version.as_deref(), Some("v1"));
        assert_eq!(s.phase, DeploymentPhase::Idle);

        let s = o.rollback(ALB).await.unwrap();
        assert_eq!(s.weight_of("v1"), 100);
        assert_eq!(s.weight_of("v2"), 0);
        assert_eq!(s.stable_version, "v1");
        assert_eq!(s.candidate_version.as_deref(), Some("v2"));
        assert_eq!(s.phase, DeploymentPhase::RolledBack);
        assert!(s.retiring_version.is_none());
    }

    #[tokio::test]
    async fn test_invalid_weights_leave_state_unchanged() {
        let (o, _, _) = orchestrator();
        o.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        let before = o.current(ALB).unwrap();

        let err = o.set_traffic_split(ALB, 60, 30).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::InvalidWeight { stable: 60, candidate: 30 }));
        assert!(o.set_traffic_weight(ALB, "v2", 101).await.is_err());
        assert_eq!(*o.current(ALB).unwrap(), *before);

        // no candidate: stable alone must carry everything
        let (o, _, _) = orchestrator();
        assert!(matches!(
            o.set_traffic_weight(ALB, "v1", 90).await,
            Err(SwitchyardError::InvalidWeight { stable: 90, candidate: 0 })
        ));
    }

    #[tokio::test]
    async fn test_weight_visible_before_return() {
        let (o, _, _) = orchestrator();
        o.set_traffic_split(ALB, 100, 0).await.unwrap();
        o.set_traffic_weight(ALB, "v2", 25).await.unwrap();
        let current = o.current(ALB).unwrap();
        assert_eq!(current.traffic_weight_candidate, 25);
        assert_eq!(current.pick_version(80), "v2");
        assert_eq!(current.pick_version(10), "v1");
    }

    #[tokio::test]
    async fn test_second_candidate_rejected_while_canary_has_traffic() {
        let (o, _, _) = orchestrator();
        o.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        assert!(matches!(
            o.set_traffic_weight(ALB, "v3", 10).await,
            Err(SwitchyardError::InvalidRequest(_))
        ));
        o.set_traffic_weight(ALB, "v2", 0).await.unwrap();
        let s = o.set_traffic_weight(ALB, "v3", 5).await.unwrap();
        assert_eq!(s.candidate_version.as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn test_rollback_from_canary_restores_snapshot() {
        let (o, _, _) = orchestrator();
        let original = o.current(ALB).unwrap().weights();
        o.set_traffic_weight(ALB, "v2", 40).await.unwrap();
        let s = o.rollback(ALB).await.unwrap();
        assert_eq!(s.traffic_weight_stable, original.weight_stable);
        assert_eq!(s.traffic_weight_candidate, original.weight_candidate);
        assert_eq!(s.stable_version, original.stable_version);
        assert_eq!(s.candidate_version.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot_is_not_found() {
        let (o, _, _) = orchestrator();
        assert!(matches!(o.rollback(ALB).await, Err(SwitchyardError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stepped_promotion_and_retirement() {
        let (o, _, _) = orchestrator();
        o.set_traffic_weight(ALB, "v2", 10).await.unwrap();

        let strategy = PromotionStrategy::Stepped {
            step: 40,
            interval_ms: 10_000,
        };
        let s = o.promote_version(ALB, Some(strategy)).await.unwrap();
        assert_eq!(s.phase, DeploymentPhase::Promoting);
        assert_eq!(s.traffic_weight_candidate, 50);

        let start = Instant::now();
        o.tick(start + Duration::from_secs(5)).await;
        assert_eq!(o.current(ALB).unwrap().traffic_weight_candidate, 50);

        o.tick(start + Duration::from_secs(10)).await;
        assert_eq!(o.current(ALB).unwrap().traffic_weight_candidate, 90);

        o.tick(start + Duration::from_secs(20)).await;
        let s = o.current(ALB).unwrap();
        assert_eq!(s.stable_version, "v2");
        assert_eq!(s.traffic_weight_stable, 100);
        assert_eq!(s.phase, DeploymentPhase::Idle);
        assert_eq!(s.retiring_version.as_deref(), Some("v1"));

        o.tick(start + Duration::from_secs(51)).await;
        assert!(o.current(ALB).unwrap().retiring_version.is_none());
        // the snapshot survives retirement until cleanup
        assert!(o.current(ALB).unwrap().last_stable_snapshot.is_some());
    }

    #[tokio::test]
    async fn test_set_weight_rejected_while_promoting() {
        let (o, _, _) = orchestrator();
        o.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        o.promote_version(
            ALB,
            Some(PromotionStrategy::Stepped {
                step: 10,
                interval_ms: 1_000,
            }),
        )
        .await
        .unwrap();
        assert!(o.set_traffic_weight(ALB, "v2", 30).await.is_err());
        let s = o.rollback(ALB).await.unwrap();
        assert_eq!(s.traffic_weight_stable, 100);
    }

    #[tokio::test]
    async fn test_promote_without_candidate() {
        let (o, _, _) = orchestrator();
        assert!(matches!(o.promote_version(ALB, None).await, Err(SwitchyardError::NotFound(_))));
        assert!(o
            .promote_version(ALB, Some(PromotionStrategy::Stepped { step: 0, interval_ms: 10 }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cleanup_forgets_candidate() {
        let (o, _, _) = orchestrator();
        o.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        assert!(o.cleanup(ALB).await.is_err());
        o.rollback(ALB).await.unwrap();

        let s = o.cleanup(ALB).await.unwrap();
        assert!(s.candidate_version.is_none());
        assert!(s.last_stable_snapshot.is_none());
        assert_eq!(s.phase, DeploymentPhase::Idle);
        assert!(matches!(o.rollback(ALB).await, Err(SwitchyardError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_transitions_recorded_and_audited() {
        let (o, _, audit) = orchestrator();
        o.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        o.promote_version(ALB, None).await.unwrap();
        o.rollback(ALB).await.unwrap();

        let info = o.info(ALB).await.unwrap();
        let actions: Vec<&str> = info.history.iter().map(|t| t.action.as_str()).collect();
        assert_eq!(actions, vec!["set_traffic_weight", "promote", "rollback"]);
        assert_eq!(info.history[0].before.traffic_weight_stable, 100);
        assert_eq!(info.history[0].after.traffic_weight_stable, 90);
        assert_eq!(info.state.generation, 3);

        let events = audit.by_category(AuditCategory::Deployment);
        assert_eq!(events.len(), 4); // initialized + three transitions
    }

    #[tokio::test]
    async fn test_weights_pushed_to_healthy_instances() {
        let modules = Arc::new(MockModuleClient::new());
        let mut instance = ModuleInstance::new(
            InstanceId::from("alb-000001"),
            RegisterModuleRequest {
                instance_id: None,
                module_type: ALB,
                address: "10.0.0.1:9000".into(),
                capabilities: vec![],
                version: "v1".into(),
            },
            Instant::now(),
        );
        instance.apply_heartbeat(0.1, HashMap::new(), 0.95, Instant::now());
        let cell = SnapshotCell::new(RoutingSnapshot::build(1, &[], [&instance]));
        let o = DeploymentOrchestrator::new(
            DeploymentConfig::default(),
            modules.clone(),
            cell,
            Arc::new(MemoryAuditSink::default()),
        );
        o.ensure_initialized(ALB, "v1");

        o.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        let mut calls = modules.weight_calls();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("10.0.0.1:9000".to_string(), "v1".to_string(), 90),
                ("10.0.0.1:9000".to_string(), "v2".to_string(), 10),
            ]
        );

        o.rollback(ALB).await.unwrap();
        assert_eq!(modules.rollback_calls(), vec!["10.0.0.1:9000".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_keeps_records() {
        let (o, _, _) = orchestrator();
        o.set_traffic_weight(ALB, "v2", 30).await.unwrap();
        let saved = o.all();

        let (restored, _, _) = orchestrator();
        restored.restore(saved.clone()).await;
        assert_eq!(restored.all(), saved);
        assert!(!restored.ensure_initialized(ALB, "v9"));
    }
}
