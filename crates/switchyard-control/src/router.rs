//! Routing Decision Engine
//!
//! Turns a request pattern into a ranked list of module instances:
//!
//! 1. read the current routing snapshot (no locks)
//! 2. enforce global and per-route rate limits
//! 3. collect Healthy instances of every matching route, dropping those
//!    behind an open circuit breaker, steering by blue/green weight, and
//!    skipping instances over their own rate limit
//! 4. ask each candidate `can_handle` (cached, bounded, retried on timeout)
//!    when there is more than one
//! 5. rank by priority, then load, then instance id
//!
//! [`RoutingEngine::dispatch`] walks the ranking with fallback.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use switchyard_common::methods::{RankedCandidate, RoutingDecision};
use switchyard_common::rate_limit::{RateLimitKey, RateLimitResult, RateLimiter};
use switchyard_common::{
    InstanceId, ModuleClient, ModuleType, RateLimit, RateLimitScope, Result, Route, SwitchyardError, TrafficPattern,
};
use switchyard_metrics::MetricsRegistry;

use crate::cache::CanHandleCache;
use crate::circuit_breaker::CircuitBreakers;
use crate::config::RoutingConfig;
use crate::deployment::DeploymentOrchestrator;
use crate::registry::RegistryHandle;
use crate::retry::{on_timeout, retry_with, RetryConfig};
use crate::snapshot::SnapshotInstance;

/// One inbound connection to route.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRequest {
    pub pattern: TrafficPattern,
    /// Picks the blue/green bucket (`connection_id % 100`).
    pub connection_id: u64,
}

impl RoutingRequest {
    pub fn new(pattern: TrafficPattern, connection_id: u64) -> Self {
        Self { pattern, connection_id }
    }
}

struct Candidate<'a> {
    instance: &'a SnapshotInstance,
    route: &'a Route,
}

/// Sorts by priority descending, load ascending, then instance id.
pub fn rank(candidates: &mut [RankedCandidate]) {
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.load.total_cmp(&b.load))
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    });
}

fn ranked(instance: &SnapshotInstance, priority: u8, load: f64) -> RankedCandidate {
    RankedCandidate {
        instance_id: instance.instance_id.clone(),
        module_type: instance.module_type,
        address: instance.address.clone(),
        version: instance.version.clone(),
        priority: priority.min(100),
        load,
    }
}

fn retry_after_ms(limit: &RateLimit) -> u64 {
    if limit.requests_per_second > 0.0 {
        (1000.0 / limit.requests_per_second).ceil().max(1.0) as u64
    } else {
        1000
    }
}

pub struct RoutingEngine {
    config: RoutingConfig,
    retry: RetryConfig,
    registry: RegistryHandle,
    deployments: Arc<DeploymentOrchestrator>,
    modules: Arc<dyn ModuleClient>,
    breakers: Arc<CircuitBreakers>,
    cache: Arc<CanHandleCache>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRegistry>,
}

impl RoutingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RoutingConfig,
        retry: RetryConfig,
        registry: RegistryHandle,
        deployments: Arc<DeploymentOrchestrator>,
        modules: Arc<dyn ModuleClient>,
        breakers: Arc<CircuitBreakers>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let cache = Arc::new(CanHandleCache::new(config.cache_ttl()));
        Self {
            config,
            retry,
            registry,
            deployments,
            modules,
            breakers,
            cache,
            limiter,
            metrics,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<CanHandleCache> {
        &self.cache
    }

    fn limited(&self, result: RateLimitResult) -> Result<()> {
        if !result.is_allowed() {
            self.metrics.record_rate_limited();
        }
        result.into_result()
    }

    /// Ranks every viable instance for `request`; the first entry is the selection.
    pub async fn decide(&self, request: &RoutingRequest) -> Result<RoutingDecision> {
        let snapshot = self.registry.snapshot();
        let now = Instant::now();
        let pattern = &request.pattern;

        let entries: Vec<_> = snapshot.matching(pattern).collect();
        if entries.is_empty() {
            self.metrics.record_not_found();
            return Err(SwitchyardError::NotFound(format!("no route for {}", pattern)));
        }

        // All buckets must have a token before any is charged.
        let mut limits: Vec<(RateLimitKey, &RateLimit)> = Vec::new();
        if let Some(limit) = &self.config.global_rate_limit {
            limits.push((RateLimitKey::Global, limit));
        }
        for entry in &entries {
            if let Some(limit) = entry.route.rate_limit.as_ref().filter(|l| l.scope == RateLimitScope::PerRoute) {
                limits.push((RateLimitKey::Route(entry.route.key()), limit));
            }
        }
        if let Some((key, limit)) = limits.iter().find(|(key, limit)| !self.limiter.would_allow(key, limit, now)) {
            self.limited(self.limiter.check(key.clone(), limit, now))?;
        }
        for (key, limit) in limits {
            self.limited(self.limiter.check(key, limit, now))?;
        }

        // Instance -> best matching route.
        let mut by_id: BTreeMap<&InstanceId, Candidate<'_>> = BTreeMap::new();
        for entry in &entries {
            for instance in &entry.instances {
                let replace = by_id
                    .get(&instance.instance_id)
                    .map(|c| c.route.static_priority < entry.route.static_priority)
                    .unwrap_or(true);
                if replace {
                    by_id.insert(
                        &instance.instance_id,
                        Candidate {
                            instance,
                            route: &entry.route,
                        },
                    );
                }
            }
        }

        let mut candidates: Vec<Candidate<'_>> = by_id
            .into_values()
            .filter(|c| self.breakers.allows(&c.instance.instance_id, now))
            .collect();
        candidates = self.steer_by_version(candidates, request.connection_id);

        let mut limited_by = None;
        candidates.retain(|c| match instance_limit(c.route) {
            Some(limit) => {
                let ok = self
                    .limiter
                    .would_allow(&RateLimitKey::Instance(c.instance.instance_id.clone()), limit, now);
                if !ok {
                    limited_by = Some(retry_after_ms(limit));
                }
                ok
            }
            None => true,
        });

        if candidates.is_empty() {
            if let Some(retry_after_ms) = limited_by {
                self.metrics.record_rate_limited();
                return Err(SwitchyardError::RateLimited { retry_after_ms });
            }
            self.metrics.record_unhealthy();
            return Err(SwitchyardError::Unhealthy(format!("no healthy instance for {}", pattern)));
        }

        let mut ranking = if candidates.len() == 1 {
            let only = &candidates[0];
            let load = self
                .metrics
                .load(&only.instance.instance_id)
                .unwrap_or(only.instance.load);
            vec![ranked(only.instance, only.route.static_priority, load)]
        } else {
            let answers = join_all(candidates.iter().map(|c| self.query(c.instance, pattern))).await;
            answers.into_iter().flatten().collect()
        };

        if ranking.is_empty() {
            self.metrics.record_unhealthy();
            return Err(SwitchyardError::Unhealthy(format!(
                "no instance for {} answered can_handle",
                pattern
            )));
        }
        rank(&mut ranking);

        let selected = &ranking[0];
        if let Some(c) = candidates.iter().find(|c| c.instance.instance_id == selected.instance_id) {
            if let Some(limit) = instance_limit(c.route) {
                self.limited(
                    self.limiter
                        .check(RateLimitKey::Instance(selected.instance_id.clone()), limit, now),
                )?;
            }
        }

        self.metrics.record_decision();
        debug!(
            pattern = %pattern,
            instance_id = %selected.instance_id,
            priority = selected.priority,
            generation = snapshot.generation,
            "routing decision"
        );
        Ok(RoutingDecision {
            generation: snapshot.generation,
            pattern: pattern.clone(),
            ranked: ranking,
        })
    }

    /// Keeps the instances running the version this connection is steered to.
    ///
    /// Without a candidate only the stable version is eligible; the retiring
    /// version and unannounced versions carry weight 0. When the steered
    /// version has no instance the stable version serves, and when neither
    /// does every instance of the type stays eligible.
    fn steer_by_version<'a>(&self, candidates: Vec<Candidate<'a>>, connection_id: u64) -> Vec<Candidate<'a>> {
        let has = |t: ModuleType, version: &str| {
            candidates
                .iter()
                .any(|c| c.instance.module_type == t && c.instance.version == version)
        };

        let mut eligible: BTreeMap<ModuleType, Option<String>> = BTreeMap::new();
        for c in &candidates {
            let t = c.instance.module_type;
            if eligible.contains_key(&t) {
                continue;
            }
            let version = self.deployments.current(t).and_then(|state| {
                let picked = state.pick_version(connection_id);
                if has(t, picked) {
                    Some(picked.to_string())
                } else if has(t, &state.stable_version) {
                    Some(state.stable_version.clone())
                } else {
                    None
                }
            });
            eligible.insert(t, version);
        }

        candidates
            .into_iter()
            .filter(|c| match eligible.get(&c.instance.module_type) {
                Some(Some(version)) => c.instance.version == *version,
                _ => true,
            })
            .collect()
    }

    async fn query(&self, instance: &SnapshotInstance, pattern: &TrafficPattern) -> Option<RankedCandidate> {
        let now = Instant::now();
        if let Some(answer) = self.cache.get(&instance.instance_id, pattern, now) {
            self.metrics.record_cache_hit();
            return Some(ranked(instance, answer.priority, answer.load));
        }

        let deadline = self.config.can_handle_timeout();
        let started = Instant::now();
        let result = retry_with(&self.retry, "can_handle", on_timeout, || async {
            match tokio::time::timeout(deadline, self.modules.can_handle(&instance.address, pattern, deadline)).await {
                Ok(result) => result,
                Err(_) => Err(SwitchyardError::Timeout(deadline.as_millis() as u64)),
            }
        })
        .await;
        self.metrics
            .record_can_handle_latency(started.elapsed().as_micros() as u64);

        match result {
            Ok(answer) => {
                self.breakers.record_success(&instance.instance_id);
                self.cache
                    .insert(instance.instance_id.clone(), pattern.clone(), answer, Instant::now());
                Some(ranked(instance, answer.priority, answer.load))
            }
            Err(e) => {
                debug!(instance_id = %instance.instance_id, "can_handle failed: {}", e);
                self.record_failure(&instance.instance_id, instance.module_type);
                None
            }
        }
    }

    fn record_failure(&self, instance_id: &InstanceId, module_type: ModuleType) {
        let now = Instant::now();
        if let Some(trip) = self.breakers.record_failure(instance_id, now) {
            warn!(
                instance_id = %instance_id,
                module_type = %module_type,
                "circuit breaker opened for {:?}",
                trip.cooldown
            );
            self.metrics.record_breaker_trip(module_type);
            self.cache.evict_instance(instance_id);
            self.registry.mark_degraded(instance_id.clone(), trip.until);
        }
    }

    /// Decides, then hands candidates to `attempt` in rank order until one succeeds.
    ///
    /// At most `max_attempts` candidates are tried, each bounded by the
    /// dispatch timeout. Exhaustion fails with [`SwitchyardError::Unhealthy`].
    pub async fn dispatch<T, F, Fut>(&self, request: &RoutingRequest, mut attempt: F) -> Result<(RankedCandidate, T)>
    where
        F: FnMut(RankedCandidate) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let decision = self.decide(request).await?;
        let deadline = self.config.dispatch_timeout();
        let mut last_error = None;

        for (i, candidate) in decision.ranked.iter().take(self.config.max_attempts).enumerate() {
            if i > 0 {
                self.metrics.record_fallback(candidate.module_type);
                debug!(instance_id = %candidate.instance_id, "falling back to candidate {}", i + 1);
            }
            let outcome = match tokio::time::timeout(deadline, attempt(candidate.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SwitchyardError::Timeout(deadline.as_millis() as u64)),
            };
            match outcome {
                Ok(value) => {
                    self.breakers.record_success(&candidate.instance_id);
                    self.metrics.record_routed(candidate.module_type);
                    return Ok((candidate.clone(), value));
                }
                Err(e) => {
                    debug!(instance_id = %candidate.instance_id, "dispatch failed: {}", e);
                    self.metrics.record_failed_dispatch(candidate.module_type);
                    self.record_failure(&candidate.instance_id, candidate.module_type);
                    last_error = Some(e);
                }
            }
        }

        self.metrics.record_unhealthy();
        Err(SwitchyardError::Unhealthy(match last_error {
            Some(e) => format!("all candidates for {} failed, last error: {}", request.pattern, e),
            None => format!("no candidate for {}", request.pattern),
        }))
    }
}

fn instance_limit(route: &Route) -> Option<&RateLimit> {
    route
        .rate_limit
        .as_ref()
        .filter(|l| l.scope == RateLimitScope::PerInstance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::{CircuitBreakerConfig, DeploymentConfig, HeartbeatConfig};
    use crate::entitlement::StaticEntitlements;
    use crate::registry::{spawn_registry, RegistryState};
    use crate::testing::MockModuleClient;
    use std::collections::HashMap;
    use switchyard_common::RegisterModuleRequest;

    const ALB: ModuleType = ModuleType::ApplicationBalancer;

    struct Fixture {
        engine: RoutingEngine,
        registry: RegistryHandle,
        modules: Arc<MockModuleClient>,
        deployments: Arc<DeploymentOrchestrator>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsRegistry>,
    }

    fn fixture_with(routes: Vec<Route>, config: RoutingConfig) -> Fixture {
        let audit = Arc::new(MemoryAuditSink::default());
        let state = RegistryState::new(
            HeartbeatConfig::default(),
            routes,
            0,
            Arc::new(StaticEntitlements::unlimited()),
            audit.clone(),
        );
        let snapshots = state.snapshots();
        let (registry, _task) = spawn_registry(state, 64);
        let modules = Arc::new(MockModuleClient::new());
        let deployments = Arc::new(DeploymentOrchestrator::new(
            DeploymentConfig::default(),
            modules.clone(),
            snapshots,
            audit,
        ));
        let metrics = Arc::new(MetricsRegistry::new());
        let limiter = Arc::new(RateLimiter::new());
        let engine = RoutingEngine::new(
            config,
            RetryConfig::default(),
            registry.clone(),
            deployments.clone(),
            modules.clone(),
            Arc::new(CircuitBreakers::new(CircuitBreakerConfig::default())),
            limiter.clone(),
            metrics.clone(),
        );
        Fixture {
            engine,
            registry,
            modules,
            deployments,
            limiter,
            metrics,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            vec![Route::new("tcp:443".parse().unwrap(), ALB, 50)],
            RoutingConfig::default(),
        )
    }

    async fn add(f: &Fixture, id: &str, version: &str) -> String {
        let address = format!("{}.internal:9000", id);
        let outcome = f
            .registry
            .register(RegisterModuleRequest {
                instance_id: Some(InstanceId::from(id)),
                module_type: ALB,
                address: address.clone(),
                capabilities: vec!["tcp:443".parse().unwrap()],
                version: version.into(),
            })
            .await
            .unwrap();
        f.registry
            .heartbeat(outcome.instance_id, 0.3, HashMap::new())
            .await
            .unwrap();
        f.deployments.ensure_initialized(ALB, version);
        address
    }

    fn request(connection_id: u64) -> RoutingRequest {
        RoutingRequest::new("tcp:443".parse().unwrap(), connection_id)
    }

    fn selected(d: &RoutingDecision) -> &str {
        d.selected().map(|c| c.instance_id.as_str()).unwrap_or("")
    }

    #[test]
    fn test_rank_order() {
        let c = |id: &str, priority: u8, load: f64| RankedCandidate {
            instance_id: InstanceId::from(id),
            module_type: ALB,
            address: String::new(),
            version: "v1".into(),
            priority,
            load,
        };
        let mut list = vec![c("c", 70, 0.1), c("b", 80, 0.5), c("a", 80, 0.5), c("d", 80, 0.2)];
        rank(&mut list);
        let ids: Vec<&str> = list.iter().map(|c| c.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_scenario_a_highest_priority_wins() {
        let f = fixture();
        let a = add(&f, "alb-a", "v1").await;
        let b = add(&f, "alb-b", "v1").await;
        f.modules.answer(&a, 80, 0.5);
        f.modules.answer(&b, 60, 0.1);

        let decision = f.engine.decide(&request(1)).await.unwrap();
        assert_eq!(selected(&decision), "alb-a");
        assert_eq!(decision.ranked.len(), 2);
        assert_eq!(decision.ranked[1].instance_id.as_str(), "alb-b");
    }

    #[tokio::test]
    async fn test_decisions_are_deterministic_and_cached() {
        let f = fixture();
        let a = add(&f, "alb-a", "v1").await;
        let b = add(&f, "alb-b", "v1").await;
        f.modules.answer(&a, 70, 0.4);
        f.modules.answer(&b, 70, 0.4);

        for _ in 0..5 {
            let decision = f.engine.decide(&request(7)).await.unwrap();
            assert_eq!(selected(&decision), "alb-a");
        }
        // one fan-out, then cache hits
        assert_eq!(f.modules.can_handle_calls(), 2);
        assert_eq!(f.metrics.snapshot().can_handle_cache_hits, 8);
    }

    #[tokio::test]
    async fn test_single_candidate_skips_can_handle() {
        let f = fixture();
        add(&f, "alb-a", "v1").await;
        let decision = f.engine.decide(&request(1)).await.unwrap();
        assert_eq!(selected(&decision), "alb-a");
        assert_eq!(decision.ranked[0].priority, 50);
        assert_eq!(f.modules.can_handle_calls(), 0);
    }

    #[tokio::test]
    async fn test_single_candidate_reports_live_load() {
        let f = fixture();
        add(&f, "alb-a", "v1").await;
        let decision = f.engine.decide(&request(1)).await.unwrap();
        assert_eq!(decision.ranked[0].load, 0.3);

        // a heartbeat that keeps the instance Healthy publishes no snapshot
        f.metrics
            .record_sample(&InstanceId::from("alb-a"), ALB, 0.75, HashMap::new());
        let decision = f.engine.decide(&request(2)).await.unwrap();
        assert_eq!(decision.ranked[0].load, 0.75);
    }

    #[tokio::test]
    async fn test_no_route_vs_no_instance() {
        let f = fixture();
        let err = f
            .engine
            .decide(&RoutingRequest::new("tcp:8443".parse().unwrap(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::NotFound(_)));

        let err = f.engine.decide(&request(1)).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Unhealthy(_)));

        let m = f.metrics.snapshot();
        assert_eq!(m.not_found, 1);
        assert_eq!(m.unhealthy, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_rate_limit_fails_fast() {
        let config = RoutingConfig {
            global_rate_limit: Some(RateLimit::new(RateLimitScope::Global, 1.0, 1)),
            ..RoutingConfig::default()
        };
        let f = fixture_with(vec![Route::new("tcp:443".parse().unwrap(), ALB, 50)], config);
        add(&f, "alb-a", "v1").await;

        assert!(f.engine.decide(&request(1)).await.is_ok());
        let err = f.engine.decide(&request(2)).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::RateLimited { .. }));
        assert_eq!(f.metrics.snapshot().rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_route_limit_charges_no_other_bucket() {
        let roomy = Route::new("tcp:443".parse().unwrap(), ALB, 50)
            .with_rate_limit(RateLimit::new(RateLimitScope::PerRoute, 1.0, 2));
        let tight = Route::new("tcp:443".parse().unwrap(), ModuleType::NetworkBalancer, 40)
            .with_rate_limit(RateLimit::new(RateLimitScope::PerRoute, 1.0, 1));
        let roomy_key = RateLimitKey::Route(roomy.key());
        let roomy_limit = roomy.rate_limit.clone().unwrap();
        let f = fixture_with(vec![roomy, tight], RoutingConfig::default());
        add(&f, "alb-a", "v1").await;

        assert!(f.engine.decide(&request(1)).await.is_ok());
        for _ in 0..3 {
            assert!(matches!(
                f.engine.decide(&request(2)).await,
                Err(SwitchyardError::RateLimited { .. })
            ));
        }
        // one token left after the first decision, untouched since
        assert!(f.limiter.would_allow(&roomy_key, &roomy_limit, Instant::now()));
        assert_eq!(f.metrics.snapshot().rate_limited, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_instance_limit_shifts_traffic() {
        let route = Route::new("tcp:443".parse().unwrap(), ALB, 50)
            .with_rate_limit(RateLimit::new(RateLimitScope::PerInstance, 1.0, 1));
        let f = fixture_with(vec![route], RoutingConfig::default());
        let a = add(&f, "alb-a", "v1").await;
        let b = add(&f, "alb-b", "v1").await;
        f.modules.answer(&a, 90, 0.1);
        f.modules.answer(&b, 10, 0.1);

        assert_eq!(selected(&f.engine.decide(&request(1)).await.unwrap()), "alb-a");
        assert_eq!(selected(&f.engine.decide(&request(2)).await.unwrap()), "alb-b");
        assert!(matches!(
            f.engine.decide(&request(3)).await,
            Err(SwitchyardError::RateLimited { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_instance_trips_breaker_and_is_isolated() {
        let f = fixture();
        let a = add(&f, "alb-a", "v1").await;
        let b = add(&f, "alb-b", "v1").await;
        f.modules.hang(&a);
        f.modules.answer(&b, 40, 0.2);

        for _ in 0..3 {
            let decision = f.engine.decide(&request(1)).await.unwrap();
            assert_eq!(selected(&decision), "alb-b");
            f.engine.cache().clear();
        }
        assert_eq!(
            f.engine.breakers().state(&InstanceId::from("alb-a")),
            crate::circuit_breaker::CircuitBreakerState::Open
        );

        // the isolation request is applied by the writer
        f.registry.rebuild().await.unwrap();
        let snapshot = f.registry.snapshot();
        assert_eq!(snapshot.entries[0].instances.len(), 1);
        let info = f.registry.get(InstanceId::from("alb-a")).await.unwrap();
        assert_eq!(info.health_status, switchyard_common::HealthStatus::Degraded);
        assert_eq!(f.metrics.snapshot().per_type[&ALB].breaker_trips, 1);
    }

    #[tokio::test]
    async fn test_blue_green_steers_by_connection_bucket() {
        let f = fixture();
        let blue = add(&f, "alb-blue", "v1").await;
        let green = add(&f, "alb-green", "v2").await;
        f.modules.answer(&blue, 90, 0.1);
        f.modules.answer(&green, 10, 0.9);

        f.deployments.set_traffic_weight(ALB, "v2", 30).await.unwrap();
        // buckets 0..70 stay on v1, 70..100 go to v2
        assert_eq!(selected(&f.engine.decide(&request(5)).await.unwrap()), "alb-blue");
        assert_eq!(selected(&f.engine.decide(&request(85)).await.unwrap()), "alb-green");
        assert_eq!(selected(&f.engine.decide(&request(185)).await.unwrap()), "alb-green");
    }

    #[tokio::test]
    async fn test_promoted_version_takes_all_traffic() {
        let f = fixture();
        let blue = add(&f, "alb-blue", "v1").await;
        let green = add(&f, "alb-green", "v2").await;
        f.modules.answer(&blue, 90, 0.1);
        f.modules.answer(&green, 10, 0.1);

        f.deployments.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        let state = f.deployments.promote_version(ALB, None).await.unwrap();
        assert_eq!(state.stable_version, "v2");
        assert_eq!(state.weight_of("v1"), 0);

        for connection_id in 0..100 {
            let decision = f.engine.decide(&request(connection_id)).await.unwrap();
            assert_eq!(selected(&decision), "alb-green");
            assert_eq!(decision.ranked.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_unannounced_version_gets_no_traffic() {
        let f = fixture();
        let blue = add(&f, "alb-blue", "v1").await;
        let green = add(&f, "alb-green", "v2").await;
        f.modules.answer(&blue, 10, 0.1);
        f.modules.answer(&green, 90, 0.1);

        for connection_id in [0, 50, 99] {
            let decision = f.engine.decide(&request(connection_id)).await.unwrap();
            assert_eq!(selected(&decision), "alb-blue");
        }
    }

    #[tokio::test]
    async fn test_missing_stable_instances_fall_back_to_any_version() {
        let f = fixture();
        add(&f, "alb-blue", "v1").await;
        f.deployments.set_traffic_weight(ALB, "v2", 10).await.unwrap();
        f.deployments.promote_version(ALB, None).await.unwrap();

        // stable is v2 but only a v1 instance is registered
        let decision = f.engine.decide(&request(3)).await.unwrap();
        assert_eq!(selected(&decision), "alb-blue");
    }

    #[tokio::test]
    async fn test_dispatch_falls_back_then_exhausts() {
        let f = fixture();
        let a = add(&f, "alb-a", "v1").await;
        let b = add(&f, "alb-b", "v1").await;
        f.modules.answer(&a, 80, 0.1);
        f.modules.answer(&b, 60, 0.1);

        let (chosen, value) = f
            .engine
            .dispatch(&request(1), |candidate| async move {
                if candidate.instance_id.as_str() == "alb-a" {
                    Err(SwitchyardError::Transport("connection refused".into()))
                } else {
                    Ok(candidate.priority)
                }
            })
            .await
            .unwrap();
        assert_eq!(chosen.instance_id.as_str(), "alb-b");
        assert_eq!(value, 60);

        let err = f
            .engine
            .dispatch(&request(1), |_| async { Err::<(), _>(SwitchyardError::Transport("down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::Unhealthy(_)));

        let stats = &f.metrics.snapshot().per_type[&ALB];
        assert_eq!(stats.routed, 1);
        assert_eq!(stats.fallbacks, 2);
        assert_eq!(stats.failed_dispatches, 3);
    }
}
