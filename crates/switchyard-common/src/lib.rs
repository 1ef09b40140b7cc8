//! Switchyard Common Types and Transport
//!
//! Shared vocabulary for every Switchyard component:
//!
//! - [`protocol`] - module/route/policy/deployment types, the error taxonomy,
//!   JSON-RPC 2.0 envelopes and method names
//! - [`module_api`] - the [`ModuleClient`] contract the control plane uses to
//!   talk to module instances
//! - [`rate_limit`] - token buckets keyed by global, route or instance scope
//! - [`transport`] - JSON-RPC over HTTP/1.1 (hyper client + body helpers)
//!
//! # Example
//!
//! ```
//! use switchyard_common::{ModuleType, TrafficPattern};
//!
//! let pattern: TrafficPattern = "http:80/api".parse().unwrap();
//! assert_eq!(pattern.port, 80);
//! assert_eq!(ModuleType::ApplicationBalancer.as_str(), "application-balancer");
//! ```

pub mod module_api;
pub mod protocol;
pub mod rate_limit;
pub mod transport;

pub use module_api::ModuleClient;
pub use protocol::*;
