//! Switchyard Clients
//!
//! - [`HttpModuleClient`] - the control plane's side of the module
//!   contract, one JSON-RPC call per operation
//! - [`ControlPlaneClient`] - typed calls into the control plane for
//!   module agents and operators

pub mod control;
pub mod module;

pub use control::ControlPlaneClient;
pub use module::HttpModuleClient;
