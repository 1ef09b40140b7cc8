//! Switchyard: a control plane for a fleet of heterogeneous load-balancer modules.
//!
//! This crate only re-exports the workspace members so the loopback
//! integration tests under `tests/` can reach every layer from one place.

pub use switchyard_agent as agent;
pub use switchyard_client as client;
pub use switchyard_common as common;
pub use switchyard_control as control;
pub use switchyard_metrics as metrics;
