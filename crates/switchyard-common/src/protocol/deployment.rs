//! Blue/green deployment records.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::error::{Result, SwitchyardError};
use crate::protocol::types::ModuleType;
use crate::protocol::unix_millis;

/// Deployment state machine: `Idle -> Canary -> Promoting -> Idle`, with
/// `RolledBack` reachable from `Canary` or `Promoting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentPhase {
    Idle,
    Canary,
    Promoting,
    RolledBack,
}

/// The weight distribution captured before a canary begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub stable_version: String,
    pub candidate_version: Option<String>,
    pub weight_stable: u8,
    pub weight_candidate: u8,
}

/// How `promote_version` moves weight to the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PromotionStrategy {
    #[default]
    Immediate,
    /// Add `step` percent of candidate weight every `interval_ms`.
    Stepped { step: u8, interval_ms: u64 },
}

impl PromotionStrategy {
    pub fn validate(&self) -> Result<()> {
        if let PromotionStrategy::Stepped { step, interval_ms } = self {
            if *step == 0 || *step > 100 {
                return Err(SwitchyardError::InvalidRequest(format!(
                    "promotion step must be within 1..=100, got {}",
                    step
                )));
            }
            if *interval_ms == 0 {
                return Err(SwitchyardError::InvalidRequest("promotion interval must be non-zero".into()));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            PromotionStrategy::Immediate => None,
            PromotionStrategy::Stepped { interval_ms, .. } => Some(Duration::from_millis(*interval_ms)),
        }
    }
}

/// Blue/green state for one module type.
///
/// Records are replaced wholesale on every transition and never mutated in
/// place once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub module_type: ModuleType,
    pub stable_version: String,
    pub candidate_version: Option<String>,
    pub traffic_weight_stable: u8,
    pub traffic_weight_candidate: u8,
    pub phase: DeploymentPhase,
    pub last_stable_snapshot: Option<WeightSnapshot>,
    /// Prior stable version waiting out its drain timeout after a promotion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retiring_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionStrategy>,
    pub generation: u64,
    pub updated_at_ms: u64,
}

impl DeploymentState {
    pub fn initial(module_type: ModuleType, stable_version: impl Into<String>) -> Self {
        Self {
            module_type,
            stable_version: stable_version.into(),
            candidate_version: None,
            traffic_weight_stable: 100,
            traffic_weight_candidate: 0,
            phase: DeploymentPhase::Idle,
            last_stable_snapshot: None,
            retiring_version: None,
            promotion: None,
            generation: 0,
            updated_at_ms: unix_millis(),
        }
    }

    /// Weight currently assigned to `version`; zero for unknown versions.
    pub fn weight_of(&self, version: &str) -> u8 {
        if self.stable_version == version {
            self.traffic_weight_stable
        } else if self.candidate_version.as_deref() == Some(version) {
            self.traffic_weight_candidate
        } else {
            0
        }
    }

    pub fn check_weights(&self) -> Result<()> {
        let sum = self.traffic_weight_stable as u32 + self.traffic_weight_candidate as u32;
        if sum != 100 {
            return Err(SwitchyardError::InvalidWeight {
                stable: self.traffic_weight_stable as u32,
                candidate: self.traffic_weight_candidate as u32,
            });
        }
        Ok(())
    }

    pub fn weights(&self) -> WeightSnapshot {
        WeightSnapshot {
            stable_version: self.stable_version.clone(),
            candidate_version: self.candidate_version.clone(),
            weight_stable: self.traffic_weight_stable,
            weight_candidate: self.traffic_weight_candidate,
        }
    }

    /// Picks the version a connection is steered to.
    ///
    /// `connection_id % 100` below the stable weight selects stable.
    pub fn pick_version(&self, connection_id: u64) -> &str {
        let bucket = (connection_id % 100) as u8;
        match &self.candidate_version {
            Some(candidate) if bucket >= self.traffic_weight_stable => candidate,
            _ => &self.stable_version,
        }
    }
}

/// A deployment state change with the records on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTransition {
    pub at_ms: u64,
    pub action: String,
    pub before: DeploymentState,
    pub after: DeploymentState,
}

/// Current record plus recent transitions, as returned by `get_deployment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub state: DeploymentState,
    pub history: Vec<DeploymentTransition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canary(stable: u8, candidate: u8) -> DeploymentState {
        let mut s = DeploymentState::initial(ModuleType::ApplicationBalancer, "v1");
        s.candidate_version = Some("v2".into());
        s.traffic_weight_stable = stable;
        s.traffic_weight_candidate = candidate;
        s.phase = DeploymentPhase::Canary;
        s
    }

    #[test]
    fn test_initial_state() {
        let s = DeploymentState::initial(ModuleType::ApplicationBalancer, "v1");
        assert_eq!(s.weight_of("v1"), 100);
        assert_eq!(s.weight_of("v2"), 0);
        assert_eq!(s.phase, DeploymentPhase::Idle);
        assert!(s.check_weights().is_ok());
    }

    #[test]
    fn test_check_weights() {
        assert!(canary(90, 10).check_weights().is_ok());
        assert!(matches!(
            canary(90, 20).check_weights(),
            Err(SwitchyardError::InvalidWeight { stable: 90, candidate: 20 })
        ));
    }

    #[test]
    fn test_pick_version_by_bucket() {
        let s = canary(90, 10);
        assert_eq!(s.pick_version(0), "v1");
        assert_eq!(s.pick_version(89), "v1");
        assert_eq!(s.pick_version(90), "v2");
        assert_eq!(s.pick_version(199), "v2");

        let all_stable = DeploymentState::initial(ModuleType::ApplicationBalancer, "v1");
        assert_eq!(all_stable.pick_version(99), "v1");

        let all_candidate = canary(0, 100);
        assert_eq!(all_candidate.pick_version(0), "v2");
    }

    #[test]
    fn test_promotion_strategy_validation() {
        assert!(PromotionStrategy::Immediate.validate().is_ok());
        assert!(PromotionStrategy::Stepped { step: 10, interval_ms: 1000 }.validate().is_ok());
        assert!(PromotionStrategy::Stepped { step: 0, interval_ms: 1000 }.validate().is_err());
        assert!(PromotionStrategy::Stepped { step: 10, interval_ms: 0 }.validate().is_err());
    }

    #[test]
    fn test_promotion_strategy_serde() {
        let s: PromotionStrategy =
            serde_json::from_str(r#"{"kind":"stepped","step":25,"interval_ms":500}"#).unwrap();
        assert_eq!(s, PromotionStrategy::Stepped { step: 25, interval_ms: 500 });
        let s: PromotionStrategy = serde_json::from_str(r#"{"kind":"immediate"}"#).unwrap();
        assert_eq!(s, PromotionStrategy::Immediate);
    }
}
