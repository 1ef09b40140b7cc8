//! Switchyard Control Plane
//!
//! Coordinates a fleet of load-balancer modules (application, database,
//! inference, media, network, egress) from one process:
//!
//! - [`registry`] - single-writer module registry publishing immutable
//!   [`snapshot::RoutingSnapshot`]s
//! - [`heartbeat`] - heartbeat ingestion, health sweeps, metric export
//! - [`router`] - CanHandle fan-out, ranking, circuit breaking, fallback
//! - [`scaling`] - per-type scaling state machines
//! - [`deployment`] - blue/green weights, promotion and rollback
//! - [`control_plane`] - the facade wiring all of the above, served over
//!   JSON-RPC by [`http_server`]

pub mod audit;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod control_plane;
pub mod deployment;
pub mod entitlement;
pub mod heartbeat;
pub mod http_router;
pub mod http_server;
pub mod instance;
pub mod persistence;
pub mod registry;
pub mod retry;
pub mod router;
pub mod scaling;
pub mod snapshot;

#[doc(hidden)]
pub mod testing;

pub use audit::{AuditCategory, AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::ControlPlaneConfig;
pub use control_plane::{ControlPlane, ControlPlaneBuilder, ControlPlaneStatus, MembershipCounts};
pub use entitlement::{Entitlements, StaticEntitlements};
pub use http_router::ControlPlaneRouter;
pub use http_server::HttpServer;
pub use router::{RoutingEngine, RoutingRequest};
