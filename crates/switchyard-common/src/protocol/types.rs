//! Core domain types shared by the control plane, clients and module agents.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::protocol::error::SwitchyardError;

/// Identity of a registered module instance.
///
/// Ordering is plain lexicographic; it is the final tie-break of every
/// routing decision, so ids assigned by the registry are zero padded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The closed set of module kinds the control plane knows how to drive.
///
/// Every kind speaks the same module contract ([`crate::ModuleClient`]); new
/// kinds are added here rather than by inspecting instances at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleType {
    ApplicationBalancer,
    DatabaseBalancer,
    InferenceBalancer,
    MediaBalancer,
    NetworkBalancer,
    EgressProxy,
}

impl ModuleType {
    pub const ALL: [ModuleType; 6] = [
        ModuleType::ApplicationBalancer,
        ModuleType::DatabaseBalancer,
        ModuleType::InferenceBalancer,
        ModuleType::MediaBalancer,
        ModuleType::NetworkBalancer,
        ModuleType::EgressProxy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleType::ApplicationBalancer => "application-balancer",
            ModuleType::DatabaseBalancer => "database-balancer",
            ModuleType::InferenceBalancer => "inference-balancer",
            ModuleType::MediaBalancer => "media-balancer",
            ModuleType::NetworkBalancer => "network-balancer",
            ModuleType::EgressProxy => "egress-proxy",
        }
    }

    /// Short prefix used when the registry assigns instance ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ModuleType::ApplicationBalancer => "alb",
            ModuleType::DatabaseBalancer => "dblb",
            ModuleType::InferenceBalancer => "ailb",
            ModuleType::MediaBalancer => "media",
            ModuleType::NetworkBalancer => "nlb",
            ModuleType::EgressProxy => "egress",
        }
    }

    /// Capabilities assumed for an instance that registers without declaring any.
    pub fn default_capabilities(&self) -> Vec<TrafficPattern> {
        let defaults: &[(&str, u16)] = match self {
            ModuleType::ApplicationBalancer => &[("http", 80), ("https", 443)],
            ModuleType::DatabaseBalancer => &[("postgres", 5432), ("mysql", 3306)],
            ModuleType::InferenceBalancer => &[("https", 443)],
            ModuleType::MediaBalancer => &[("rtmp", 1935)],
            ModuleType::NetworkBalancer => &[("tcp", 443), ("udp", 53)],
            ModuleType::EgressProxy => &[("http", 3128)],
        };
        defaults
            .iter()
            .map(|(protocol, port)| TrafficPattern::new(*protocol, *port))
            .collect()
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleType {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s || t.id_prefix() == s)
            .ok_or_else(|| SwitchyardError::InvalidRequest(format!("unknown module type '{}'", s)))
    }
}

/// Per-instance health state.
///
/// `Unknown -> Healthy <-> Degraded -> Unhealthy -> removed`. Only heartbeats,
/// the sweep and the circuit breaker move an instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// A traffic pattern: `protocol:port[/path-prefix]`.
///
/// Used both for route patterns and for the capabilities an instance
/// declares. Protocols are compared case-insensitively (stored lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrafficPattern {
    pub protocol: String,
    pub port: u16,
    pub path: Option<String>,
}

impl TrafficPattern {
    pub fn new(protocol: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into().to_ascii_lowercase(),
            port,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Returns true if a request for `request` is covered by this pattern.
    ///
    /// Protocol and port must be equal; when this pattern carries a path the
    /// request path must start with it.
    pub fn matches(&self, request: &TrafficPattern) -> bool {
        if self.protocol != request.protocol || self.port != request.port {
            return false;
        }
        match (&self.path, &request.path) {
            (None, _) => true,
            (Some(prefix), Some(path)) => path.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for TrafficPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)?;
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        Ok(())
    }
}

impl FromStr for TrafficPattern {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| SwitchyardError::InvalidRoute(format!("pattern '{}': {}", s, why));

        let (protocol, rest) = s.split_once(':').ok_or_else(|| invalid("expected protocol:port"))?;
        if protocol.is_empty() || !protocol.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("bad protocol"));
        }

        let (port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(rest[idx..].to_string())),
            None => (rest, None),
        };
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self {
            protocol: protocol.to_ascii_lowercase(),
            port,
            path,
        })
    }
}

impl TryFrom<String> for TrafficPattern {
    type Error = SwitchyardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TrafficPattern> for String {
    fn from(p: TrafficPattern) -> Self {
        p.to_string()
    }
}

/// Registration payload sent by a module instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterModuleRequest {
    /// Caller-chosen id; the registry assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    pub module_type: ModuleType,
    /// host:port serving both the module contract and data traffic
    pub address: String,
    #[serde(default)]
    pub capabilities: Vec<TrafficPattern>,
    pub version: String,
}

/// Read-only view of a registered instance as returned by list/get queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleInstanceInfo {
    pub instance_id: InstanceId,
    pub module_type: ModuleType,
    pub address: String,
    pub capabilities: Vec<TrafficPattern>,
    pub version: String,
    pub health_status: HealthStatus,
    /// Milliseconds since the last heartbeat (or registration when none yet).
    pub last_heartbeat_age_ms: u64,
    pub current_load: f64,
    #[serde(default)]
    pub custom_metrics: HashMap<String, f64>,
    /// Wall-clock registration time, unix millis.
    pub registered_at_ms: u64,
}

/// Answer to `can_handle(pattern)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanHandleResponse {
    /// 0..=100, higher wins
    pub priority: u8,
    /// normalized 0..=1
    pub load: f64,
}

/// Answer to `get_status()` on a module instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub healthy: bool,
    pub version: String,
    pub load: f64,
    #[serde(default)]
    pub replicas: Option<u32>,
}

/// Result of a shallow or deep health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Acknowledgement of a `scale(target)` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleAck {
    pub accepted: bool,
    pub replicas: u32,
}
