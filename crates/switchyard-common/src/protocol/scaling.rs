//! Scaling policies and controller status types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::error::{Result, SwitchyardError};
use crate::protocol::types::ModuleType;

/// Name of the built-in metric carried by every heartbeat.
pub const LOAD_METRIC: &str = "load";

/// A threshold that must hold continuously for a window before it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingTrigger {
    /// `load` or the name of a custom metric
    pub metric: String,
    pub threshold: f64,
    pub sustained_window_ms: u64,
}

impl ScalingTrigger {
    pub fn new(metric: impl Into<String>, threshold: f64, sustained_window: Duration) -> Self {
        Self {
            metric: metric.into(),
            threshold,
            sustained_window_ms: sustained_window.as_millis() as u64,
        }
    }

    pub fn sustained_window(&self) -> Duration {
        Duration::from_millis(self.sustained_window_ms)
    }
}

fn default_step() -> u32 {
    1
}

/// Autoscaling bounds and triggers for one module type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub module_type: ModuleType,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub scale_up: ScalingTrigger,
    pub scale_down: ScalingTrigger,
    pub cooldown_ms: u64,
    /// Replicas added or removed per automatic action.
    #[serde(default = "default_step")]
    pub step: u32,
}

impl ScalingPolicy {
    /// A load-driven policy: scale up above 0.8 for 30s, down below 0.3 for 5min.
    pub fn load_based(module_type: ModuleType, min_replicas: u32, max_replicas: u32) -> Self {
        Self {
            module_type,
            min_replicas,
            max_replicas,
            scale_up: ScalingTrigger::new(LOAD_METRIC, 0.8, Duration::from_secs(30)),
            scale_down: ScalingTrigger::new(LOAD_METRIC, 0.3, Duration::from_secs(300)),
            cooldown_ms: 60_000,
            step: 1,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SwitchyardError::InvalidPolicy(msg));

        if self.min_replicas > self.max_replicas {
            return invalid(format!(
                "min_replicas {} exceeds max_replicas {}",
                self.min_replicas, self.max_replicas
            ));
        }
        if self.max_replicas == 0 {
            return invalid("max_replicas must be at least 1".into());
        }
        if self.step == 0 {
            return invalid("step must be at least 1".into());
        }
        if self.scale_up.metric.is_empty() || self.scale_down.metric.is_empty() {
            return invalid("scale metrics must be named".into());
        }
        if !self.scale_up.threshold.is_finite() || !self.scale_down.threshold.is_finite() {
            return invalid("thresholds must be finite".into());
        }
        if self.scale_up.metric == self.scale_down.metric
            && self.scale_down.threshold >= self.scale_up.threshold
        {
            return invalid(format!(
                "scale-down threshold {} must be below scale-up threshold {}",
                self.scale_down.threshold, self.scale_up.threshold
            ));
        }
        if self.scale_down.sustained_window_ms <= self.scale_up.sustained_window_ms {
            return invalid(format!(
                "scale-down window {}ms must be longer than scale-up window {}ms",
                self.scale_down.sustained_window_ms, self.scale_up.sustained_window_ms
            ));
        }
        Ok(())
    }
}

/// Per-module-type scaling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingPhase {
    Stable,
    ScalingUp,
    ScalingDown,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingEventKind {
    ScaledUp,
    ScaledDown,
    LimitReached,
    CommandFailed,
}

/// One entry of the bounded scaling history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub at_ms: u64,
    pub module_type: ModuleType,
    pub kind: ScalingEventKind,
    pub from_replicas: u32,
    pub to_replicas: u32,
    pub manual: bool,
    /// Metric value that triggered an automatic action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Snapshot of one module type's scaling controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingStatus {
    pub module_type: ModuleType,
    pub policy: ScalingPolicy,
    pub phase: ScalingPhase,
    pub replica_count: Option<u32>,
    pub cooldown_remaining_ms: u64,
    /// Raised after a scale command exhausted its retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub history: Vec<ScalingEvent>,
}
