//! Control plane configuration.
//!
//! Every section has production defaults; a JSON file only needs to name
//! what it changes. Durations are integer milliseconds (`*_ms`).
//!
//! ```
//! use switchyard_control::config::ControlPlaneConfig;
//!
//! let config: ControlPlaneConfig = serde_json::from_str(
//!     r#"{ "bind_addr": "0.0.0.0:7600", "heartbeat": { "interval_ms": 5000 } }"#,
//! ).unwrap();
//! assert_eq!(config.heartbeat.interval_ms, 5000);
//! assert_eq!(config.heartbeat.stale_multiplier, 3);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use switchyard_common::{validate_routes, RateLimit, RateLimitScope, Result, Route, ScalingPolicy, SwitchyardError};

use crate::retry::RetryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval instances are told to heartbeat at.
    pub interval_ms: u64,
    pub sweep_interval_ms: u64,
    /// An instance is Unhealthy once `now - last_heartbeat > stale_multiplier * interval`.
    pub stale_multiplier: u32,
    /// Extra silence after going Unhealthy before automatic unregistration.
    pub removal_grace_ms: u64,
    /// Heartbeats reporting load above this mark the instance Degraded.
    pub degraded_load_threshold: f64,
    /// Aggregates are pushed to the metrics sink every this many sweeps.
    pub publish_every_sweeps: u32,
    /// Deadline for `check_health` probes fanned out to instances.
    pub probe_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            sweep_interval_ms: 1_000,
            stale_multiplier: 3,
            removal_grace_ms: 60_000,
            degraded_load_threshold: 0.95,
            publish_every_sweeps: 10,
            probe_timeout_ms: 2_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        self.interval() * self.stale_multiplier
    }

    /// Silence after which an instance is unregistered.
    pub fn remove_after(&self) -> Duration {
        self.stale_after() + Duration::from_millis(self.removal_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Bounded mutation queue; heartbeats are rejected with `Overloaded` when full.
    pub queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub can_handle_timeout_ms: u64,
    pub can_handle_cache_ttl_ms: u64,
    /// Candidates tried per dispatch before failing with `Unhealthy`.
    pub max_attempts: usize,
    pub dispatch_timeout_ms: u64,
    pub global_rate_limit: Option<RateLimit>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            can_handle_timeout_ms: 250,
            can_handle_cache_ttl_ms: 500,
            max_attempts: 3,
            dispatch_timeout_ms: 1_000,
            global_rate_limit: None,
        }
    }
}

impl RoutingConfig {
    pub fn can_handle_timeout(&self) -> Duration {
        Duration::from_millis(self.can_handle_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.can_handle_cache_ttl_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// Per-instance circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive CanHandle/dispatch failures before the breaker opens.
    pub failure_threshold: u32,
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    /// Cooldown grows by this factor for each trip without a success in between.
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown after the `trips`-th consecutive trip (1-based).
    pub fn cooldown(&self, trips: u32) -> Duration {
        let exponent = trips.saturating_sub(1).min(32) as i32;
        let ms = self.base_cooldown_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis((ms as u64).min(self.max_cooldown_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub tick_interval_ms: u64,
    pub command_timeout_ms: u64,
    /// Attempts per scale command before raising an alert.
    pub command_retries: u32,
    pub history_limit: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            command_timeout_ms: 2_000,
            command_retries: 3,
            history_limit: 100,
        }
    }
}

impl ScalingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// How long a replaced stable version keeps draining before it is retired.
    pub drain_timeout_ms: u64,
    pub tick_interval_ms: u64,
    /// Deadline for pushing weights to module instances.
    pub push_timeout_ms: u64,
    pub history_limit: usize,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 30_000,
            tick_interval_ms: 1_000,
            push_timeout_ms: 2_000,
            history_limit: 50,
        }
    }
}

impl DeploymentConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

/// Everything the control plane needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub bind_addr: String,
    pub heartbeat: HeartbeatConfig,
    pub registry: RegistryConfig,
    pub routing: RoutingConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub scaling: ScalingConfig,
    pub deployment: DeploymentConfig,
    /// Initial route table; persisted state takes precedence.
    pub routes: Vec<Route>,
    pub scaling_policies: Vec<ScalingPolicy>,
    /// Entitlement: maximum concurrently registered instances.
    pub max_instances: Option<usize>,
    pub state_file: Option<PathBuf>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7600".to_string(),
            heartbeat: HeartbeatConfig::default(),
            registry: RegistryConfig::default(),
            routing: RoutingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            scaling: ScalingConfig::default(),
            deployment: DeploymentConfig::default(),
            routes: Vec::new(),
            scaling_policies: Vec::new(),
            max_instances: None,
            state_file: None,
        }
    }
}

impl ControlPlaneConfig {
    /// Loads and validates a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ControlPlaneConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SwitchyardError::InvalidRequest(format!("config: {}", msg)));

        if self.heartbeat.interval_ms == 0 || self.heartbeat.sweep_interval_ms == 0 {
            return invalid("heartbeat and sweep intervals must be non-zero");
        }
        if self.heartbeat.stale_multiplier == 0 {
            return invalid("stale_multiplier must be at least 1");
        }
        if self.registry.queue_capacity == 0 {
            return invalid("registry queue_capacity must be at least 1");
        }
        if self.routing.max_attempts == 0 {
            return invalid("routing max_attempts must be at least 1");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit breaker failure_threshold must be at least 1");
        }
        if self.scaling.tick_interval_ms == 0 || self.deployment.tick_interval_ms == 0 {
            return invalid("tick intervals must be non-zero");
        }
        if let Some(limit) = &self.routing.global_rate_limit {
            if limit.scope != RateLimitScope::Global {
                return invalid("routing.global_rate_limit must use the global scope");
            }
            limit.validate()?;
        }
        validate_routes(&self.routes).map_err(|errors| SwitchyardError::InvalidRoute(errors.join("; ")))?;
        for policy in &self.scaling_policies {
            policy.validate()?;
        }
        Ok(())
    }
}
