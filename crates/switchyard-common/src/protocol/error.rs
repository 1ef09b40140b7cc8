use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::jsonrpc::{self, JsonRpcError};
use crate::protocol::types::ModuleType;

#[derive(Error, Debug)]
pub enum SwitchyardError {
    #[error("Registration conflict: {module_type} instance already active at {address}")]
    RegistrationConflict { module_type: ModuleType, address: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No viable instance: {0}")]
    Unhealthy(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Scaling limit reached for {module_type}: target {target} outside [{min}, {max}]")]
    ScalingLimitReached {
        module_type: ModuleType,
        target: i64,
        min: u32,
        max: u32,
    },

    #[error("Invalid traffic weights: stable {stable} + candidate {candidate} != 100")]
    InvalidWeight { stable: u32, candidate: u32 },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Invalid scaling policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Scaling already in progress for {0}")]
    ScalingInProgress(ModuleType),

    #[error("Entitlement exceeded: at most {limit} instances may be registered")]
    EntitlementExceeded { limit: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control plane is shutting down")]
    Shutdown,

    /// An error code this side does not recognise, passed through verbatim.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },
}

// Server-defined JSON-RPC error codes.
pub const CODE_REGISTRATION_CONFLICT: i32 = -32010;
pub const CODE_NOT_FOUND: i32 = -32011;
pub const CODE_UNHEALTHY: i32 = -32012;
pub const CODE_TIMEOUT: i32 = -32013;
pub const CODE_SCALING_LIMIT_REACHED: i32 = -32014;
pub const CODE_INVALID_WEIGHT: i32 = -32015;
pub const CODE_RATE_LIMITED: i32 = -32016;
pub const CODE_OVERLOADED: i32 = -32017;
pub const CODE_INVALID_ROUTE: i32 = -32018;
pub const CODE_INVALID_POLICY: i32 = -32019;
pub const CODE_INVALID_REQUEST: i32 = -32020;
pub const CODE_SCALING_IN_PROGRESS: i32 = -32021;
pub const CODE_ENTITLEMENT_EXCEEDED: i32 = -32022;
pub const CODE_TRANSPORT: i32 = -32023;
pub const CODE_SHUTDOWN: i32 = -32024;
pub const CODE_SERIALIZATION: i32 = -32025;
pub const CODE_IO: i32 = -32026;

impl SwitchyardError {
    /// Errors worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SwitchyardError::Timeout(_) | SwitchyardError::Transport(_) | SwitchyardError::Overloaded(_)
        )
    }

    pub fn code(&self) -> i32 {
        match self {
            SwitchyardError::RegistrationConflict { .. } => CODE_REGISTRATION_CONFLICT,
            SwitchyardError::NotFound(_) => CODE_NOT_FOUND,
            SwitchyardError::Unhealthy(_) => CODE_UNHEALTHY,
            SwitchyardError::Timeout(_) => CODE_TIMEOUT,
            SwitchyardError::ScalingLimitReached { .. } => CODE_SCALING_LIMIT_REACHED,
            SwitchyardError::InvalidWeight { .. } => CODE_INVALID_WEIGHT,
            SwitchyardError::RateLimited { .. } => CODE_RATE_LIMITED,
            SwitchyardError::Overloaded(_) => CODE_OVERLOADED,
            SwitchyardError::InvalidRoute(_) => CODE_INVALID_ROUTE,
            SwitchyardError::InvalidPolicy(_) => CODE_INVALID_POLICY,
            SwitchyardError::InvalidRequest(_) => CODE_INVALID_REQUEST,
            SwitchyardError::ScalingInProgress(_) => CODE_SCALING_IN_PROGRESS,
            SwitchyardError::EntitlementExceeded { .. } => CODE_ENTITLEMENT_EXCEEDED,
            SwitchyardError::Transport(_) => CODE_TRANSPORT,
            SwitchyardError::Shutdown => CODE_SHUTDOWN,
            SwitchyardError::JsonSerialization(_) => CODE_SERIALIZATION,
            SwitchyardError::Io(_) => CODE_IO,
            SwitchyardError::Remote { code, .. } => *code,
        }
    }

    fn data(&self) -> Option<Value> {
        let data = match self {
            SwitchyardError::RegistrationConflict { module_type, address } => {
                json!({ "module_type": module_type, "address": address })
            }
            SwitchyardError::NotFound(detail)
            | SwitchyardError::Unhealthy(detail)
            | SwitchyardError::Overloaded(detail)
            | SwitchyardError::InvalidRoute(detail)
            | SwitchyardError::InvalidPolicy(detail)
            | SwitchyardError::InvalidRequest(detail)
            | SwitchyardError::Transport(detail) => json!({ "detail": detail }),
            SwitchyardError::Timeout(ms) => json!({ "timeout_ms": ms }),
            SwitchyardError::ScalingLimitReached { module_type, target, min, max } => {
                json!({ "module_type": module_type, "target": target, "min": min, "max": max })
            }
            SwitchyardError::InvalidWeight { stable, candidate } => {
                json!({ "stable": stable, "candidate": candidate })
            }
            SwitchyardError::RateLimited { retry_after_ms } => json!({ "retry_after_ms": retry_after_ms }),
            SwitchyardError::ScalingInProgress(module_type) => json!({ "module_type": module_type }),
            SwitchyardError::EntitlementExceeded { limit } => json!({ "limit": limit }),
            _ => return None,
        };
        Some(data)
    }

    /// Converts into a wire error carrying enough data to rebuild the variant.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        JsonRpcError {
            code: self.code(),
            message: self.to_string(),
            data: self.data(),
        }
    }

    /// Rebuilds the taxonomy from a wire error.
    ///
    /// Unknown codes, or known codes with unusable data, become [`SwitchyardError::Remote`].
    pub fn from_jsonrpc(err: JsonRpcError) -> Self {
        let data = err.data.clone().unwrap_or(Value::Null);
        let detail = data
            .get("detail")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.message.clone());
        let field = |name: &str| data.get(name).cloned().unwrap_or(Value::Null);
        let module_type = || serde_json::from_value::<ModuleType>(field("module_type")).ok();
        let uint = |name: &str| data.get(name).and_then(Value::as_u64);

        let rebuilt = match err.code {
            CODE_REGISTRATION_CONFLICT => module_type().map(|module_type| SwitchyardError::RegistrationConflict {
                module_type,
                address: data.get("address").and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            CODE_NOT_FOUND => Some(SwitchyardError::NotFound(detail)),
            CODE_UNHEALTHY => Some(SwitchyardError::Unhealthy(detail)),
            CODE_TIMEOUT => Some(SwitchyardError::Timeout(uint("timeout_ms").unwrap_or(0))),
            CODE_SCALING_LIMIT_REACHED => module_type().map(|module_type| SwitchyardError::ScalingLimitReached {
                module_type,
                target: data.get("target").and_then(Value::as_i64).unwrap_or(0),
                min: uint("min").unwrap_or(0) as u32,
                max: uint("max").unwrap_or(0) as u32,
            }),
            CODE_INVALID_WEIGHT => Some(SwitchyardError::InvalidWeight {
                stable: uint("stable").unwrap_or(0) as u32,
                candidate: uint("candidate").unwrap_or(0) as u32,
            }),
            CODE_RATE_LIMITED => Some(SwitchyardError::RateLimited {
                retry_after_ms: uint("retry_after_ms").unwrap_or(0),
            }),
            CODE_OVERLOADED => Some(SwitchyardError::Overloaded(detail)),
            CODE_INVALID_ROUTE => Some(SwitchyardError::InvalidRoute(detail)),
            CODE_INVALID_POLICY => Some(SwitchyardError::InvalidPolicy(detail)),
            CODE_INVALID_REQUEST | jsonrpc::INVALID_PARAMS | jsonrpc::INVALID_REQUEST => {
                Some(SwitchyardError::InvalidRequest(detail))
            }
            CODE_SCALING_IN_PROGRESS => module_type().map(SwitchyardError::ScalingInProgress),
            CODE_ENTITLEMENT_EXCEEDED => Some(SwitchyardError::EntitlementExceeded {
                limit: uint("limit").unwrap_or(0) as usize,
            }),
            CODE_TRANSPORT => Some(SwitchyardError::Transport(detail)),
            CODE_SHUTDOWN => Some(SwitchyardError::Shutdown),
            _ => None,
        };

        rebuilt.unwrap_or(SwitchyardError::Remote {
            code: err.code,
            message: err.message,
        })
    }
}

impl From<std::net::AddrParseError> for SwitchyardError {
    fn from(err: std::net::AddrParseError) -> Self {
        SwitchyardError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn through_wire(err: SwitchyardError) -> SwitchyardError {
        let wire = err.to_jsonrpc();
        let json = serde_json::to_string(&wire).unwrap();
        SwitchyardError::from_jsonrpc(serde_json::from_str(&json).unwrap())
    }

    #[test]
    fn test_structured_variants_survive_the_wire() {
        match through_wire(SwitchyardError::RegistrationConflict {
            module_type: ModuleType::DatabaseBalancer,
            address: "10.0.0.1:7000".into(),
        }) {
            SwitchyardError::RegistrationConflict { module_type, address } => {
                assert_eq!(module_type, ModuleType::DatabaseBalancer);
                assert_eq!(address, "10.0.0.1:7000");
            }
            other => panic!("unexpected {:?}", other),
        }

        match through_wire(SwitchyardError::ScalingLimitReached {
            module_type: ModuleType::ApplicationBalancer,
            target: 6,
            min: 1,
            max: 5,
        }) {
            SwitchyardError::ScalingLimitReached { target, max, .. } => {
                assert_eq!(target, 6);
                assert_eq!(max, 5);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            through_wire(SwitchyardError::InvalidWeight { stable: 90, candidate: 20 }),
            SwitchyardError::InvalidWeight { stable: 90, candidate: 20 }
        ));
        assert!(matches!(
            through_wire(SwitchyardError::RateLimited { retry_after_ms: 120 }),
            SwitchyardError::RateLimited { retry_after_ms: 120 }
        ));
    }

    #[test]
    fn test_detail_is_preserved() {
        match through_wire(SwitchyardError::NotFound("instance alb-000001".into())) {
            SwitchyardError::NotFound(detail) => assert_eq!(detail, "instance alb-000001"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_code_becomes_remote() {
        let err = SwitchyardError::from_jsonrpc(JsonRpcError::method_not_found());
        assert!(matches!(err, SwitchyardError::Remote { code: -32601, .. }));
    }

    #[test]
    fn test_invalid_params_maps_to_invalid_request() {
        let err = SwitchyardError::from_jsonrpc(JsonRpcError::invalid_params("missing field"));
        match err {
            SwitchyardError::InvalidRequest(msg) => assert_eq!(msg, "missing field"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_is_transient() {
        assert!(SwitchyardError::Timeout(250).is_transient());
        assert!(SwitchyardError::Transport("refused".into()).is_transient());
        assert!(SwitchyardError::Overloaded("queue full".into()).is_transient());
        assert!(!SwitchyardError::InvalidWeight { stable: 1, candidate: 1 }.is_transient());
        assert!(!SwitchyardError::NotFound("x".into()).is_transient());
    }
}
