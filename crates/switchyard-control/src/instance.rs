//! The registry's record of one module instance and its health state machine.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use switchyard_common::{
    unix_millis, HealthStatus, InstanceId, ModuleInstanceInfo, ModuleType, RegisterModuleRequest, TrafficPattern,
};

/// A module instance as held by the registry writer.
///
/// Health moves `Unknown -> Healthy <-> Degraded -> Unhealthy`; only
/// heartbeats, the sweep and breaker trips change it.
#[derive(Debug, Clone)]
pub struct ModuleInstance {
    pub instance_id: InstanceId,
    pub module_type: ModuleType,
    pub address: String,
    pub capabilities: Vec<TrafficPattern>,
    pub version: String,
    pub health_status: HealthStatus,
    /// Registration time until the first heartbeat arrives.
    pub last_heartbeat: Instant,
    pub current_load: f64,
    pub custom_metrics: HashMap<String, f64>,
    pub registered_at: Instant,
    pub registered_at_ms: u64,
    /// Set while an open circuit breaker isolates the instance.
    pub isolated_until: Option<Instant>,
}

/// Health before and after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: HealthStatus,
    pub to: HealthStatus,
}

impl HealthTransition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

impl ModuleInstance {
    pub fn new(instance_id: InstanceId, request: RegisterModuleRequest, now: Instant) -> Self {
        let capabilities = if request.capabilities.is_empty() {
            request.module_type.default_capabilities()
        } else {
            request.capabilities
        };
        Self {
            instance_id,
            module_type: request.module_type,
            address: request.address,
            capabilities,
            version: request.version,
            health_status: HealthStatus::Unknown,
            last_heartbeat: now,
            current_load: 0.0,
            custom_metrics: HashMap::new(),
            registered_at: now,
            registered_at_ms: unix_millis(),
            isolated_until: None,
        }
    }

    /// True when one of the declared capabilities covers `pattern`.
    pub fn serves(&self, pattern: &TrafficPattern) -> bool {
        self.capabilities.iter().any(|c| c.matches(pattern))
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn is_isolated(&self, now: Instant) -> bool {
        self.isolated_until.map(|until| now < until).unwrap_or(false)
    }

    fn set_health(&mut self, to: HealthStatus) -> HealthTransition {
        let from = self.health_status;
        self.health_status = to;
        HealthTransition { from, to }
    }

    /// Applies a heartbeat.
    ///
    /// The instance becomes Healthy when its load is within `degraded_threshold`
    /// and no breaker isolates it, Degraded otherwise.
    pub fn apply_heartbeat(
        &mut self,
        load: f64,
        custom_metrics: HashMap<String, f64>,
        degraded_threshold: f64,
        now: Instant,
    ) -> HealthTransition {
        self.last_heartbeat = now;
        self.current_load = load;
        self.custom_metrics = custom_metrics;
        if !self.is_isolated(now) {
            self.isolated_until = None;
        }

        let next = if load > degraded_threshold || self.is_isolated(now) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        self.set_health(next)
    }

    /// Isolates the instance until `until` (circuit breaker trip).
    pub fn isolate(&mut self, until: Instant) -> HealthTransition {
        self.isolated_until = Some(until);
        match self.health_status {
            HealthStatus::Unhealthy => self.set_health(HealthStatus::Unhealthy),
            _ => self.set_health(HealthStatus::Degraded),
        }
    }

    /// Sweep step: demotes stale instances and lifts expired isolation.
    pub fn sweep(&mut self, stale_after: Duration, degraded_threshold: f64, now: Instant) -> HealthTransition {
        if self.silence(now) > stale_after {
            return self.set_health(HealthStatus::Unhealthy);
        }
        if self.health_status == HealthStatus::Degraded
            && self.isolated_until.is_some()
            && !self.is_isolated(now)
        {
            self.isolated_until = None;
            if self.current_load <= degraded_threshold {
                return self.set_health(HealthStatus::Healthy);
            }
        }
        HealthTransition {
            from: self.health_status,
            to: self.health_status,
        }
    }

    pub fn info(&self, now: Instant) -> ModuleInstanceInfo {
        ModuleInstanceInfo {
            instance_id: self.instance_id.clone(),
            module_type: self.module_type,
            address: self.address.clone(),
            capabilities: self.capabilities.clone(),
            version: self.version.clone(),
            health_status: self.health_status,
            last_heartbeat_age_ms: self.silence(now).as_millis() as u64,
            current_load: self.current_load,
            custom_metrics: self.custom_metrics.clone(),
            registered_at_ms: self.registered_at_ms,
        }
    }
}
