//! Route rules and rate limits.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::protocol::error::{Result, SwitchyardError};
use crate::protocol::types::{InstanceId, ModuleType, TrafficPattern};

/// Where a rate limit applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitScope {
    Global,
    PerRoute,
    PerInstance,
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub scope: RateLimitScope,
    pub requests_per_second: f64,
    pub burst: u32,
}

impl RateLimit {
    pub fn new(scope: RateLimitScope, requests_per_second: f64, burst: u32) -> Self {
        Self {
            scope,
            requests_per_second,
            burst,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(SwitchyardError::InvalidRoute(format!(
                "rate limit requests_per_second must be positive, got {}",
                self.requests_per_second
            )));
        }
        if self.burst == 0 {
            return Err(SwitchyardError::InvalidRoute("rate limit burst must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

/// An administrator-defined rule mapping a traffic pattern to a module type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub pattern: TrafficPattern,
    pub target_module_type: ModuleType,
    /// Baseline weight 0..=100, used as the score of an unqueried candidate.
    pub static_priority: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl Route {
    pub fn new(pattern: TrafficPattern, target_module_type: ModuleType, static_priority: u8) -> Self {
        Self {
            pattern,
            target_module_type,
            static_priority,
            enabled: true,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Stable key used for per-route rate limiting and statistics.
    pub fn key(&self) -> String {
        format!("{}->{}", self.pattern, self.target_module_type)
    }

    /// Checks a single route in isolation.
    pub fn validate(&self) -> Result<()> {
        if self.static_priority > 100 {
            return Err(SwitchyardError::InvalidRoute(format!(
                "route {}: static_priority {} exceeds 100",
                self.key(),
                self.static_priority
            )));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.scope == RateLimitScope::Global {
                return Err(SwitchyardError::InvalidRoute(format!(
                    "route {}: global limits belong in the control plane config",
                    self.key()
                )));
            }
            limit.validate()?;
        }
        Ok(())
    }
}

/// Validates a complete route table.
///
/// Besides per-route checks, at most one enabled route may exist per
/// `(pattern, target_module_type)`. Returns every problem found so callers
/// doing a dry run see them all at once.
pub fn validate_routes(routes: &[Route]) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let mut seen: HashSet<(&TrafficPattern, ModuleType)> = HashSet::new();

    for route in routes {
        if let Err(e) = route.validate() {
            errors.push(e.to_string());
        }
        if route.enabled && !seen.insert((&route.pattern, route.target_module_type)) {
            errors.push(format!(
                "duplicate enabled route for pattern {} and module type {}",
                route.pattern, route.target_module_type
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// One row of `get_routing_table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntryView {
    pub route: Route,
    pub instances: Vec<InstanceId>,
}

/// Serializable view of the currently published routing snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTableView {
    pub generation: u64,
    pub built_at_ms: u64,
    pub entries: Vec<RouteEntryView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(pattern: &str, t: ModuleType) -> Route {
        Route::new(pattern.parse().unwrap(), t, 50)
    }

    #[test]
    fn test_validate_routes_accepts_distinct_types_on_same_pattern() {
        let routes = vec![
            route("tcp:443", ModuleType::ApplicationBalancer),
            route("tcp:443", ModuleType::NetworkBalancer),
        ];
        assert!(validate_routes(&routes).is_ok());
    }

    #[test]
    fn test_validate_routes_rejects_duplicate_enabled() {
        let routes = vec![
            route("tcp:443", ModuleType::ApplicationBalancer),
            route("tcp:443", ModuleType::ApplicationBalancer),
        ];
        let errors = validate_routes(&routes).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("duplicate"));
    }

    #[test]
    fn test_validate_routes_ignores_disabled_duplicate() {
        let routes = vec![
            route("tcp:443", ModuleType::ApplicationBalancer),
            route("tcp:443", ModuleType::ApplicationBalancer).disabled(),
        ];
        assert!(validate_routes(&routes).is_ok());
    }

    #[test]
    fn test_route_validation() {
        let mut r = route("tcp:443", ModuleType::ApplicationBalancer);
        r.static_priority = 101;
        assert!(matches!(r.validate(), Err(SwitchyardError::InvalidRoute(_))));

        let r = route("tcp:443", ModuleType::ApplicationBalancer)
            .with_rate_limit(RateLimit::new(RateLimitScope::PerRoute, 0.0, 10));
        assert!(r.validate().is_err());

        let r = route("tcp:443", ModuleType::ApplicationBalancer)
            .with_rate_limit(RateLimit::new(RateLimitScope::Global, 10.0, 10));
        assert!(r.validate().is_err());

        let r = route("tcp:443", ModuleType::ApplicationBalancer)
            .with_rate_limit(RateLimit::new(RateLimitScope::PerInstance, 10.0, 10));
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_route_serde_defaults_enabled() {
        let r: Route = serde_json::from_str(
            r#"{"pattern":"tcp:443","target_module_type":"application-balancer","static_priority":10}"#,
        )
        .unwrap();
        assert!(r.enabled);
        assert!(r.rate_limit.is_none());
    }
}
