//! Switchyard Module Agent
//!
//! Everything a module instance needs to join a Switchyard fleet:
//!
//! - [`ModuleHandler`] - the module contract (CanHandle, Scale,
//!   SetTrafficWeight, ...) as a trait
//! - [`StaticModule`] - a configurable in-memory implementation for demos
//!   and tests
//! - [`AgentServer`] - serves a handler over JSON-RPC
//! - [`ModuleAgent`] - registers with the control plane and heartbeats,
//!   retrying transient rejections and re-registering after removal

pub mod agent;
pub mod handler;
pub mod server;

pub use agent::{AgentConfig, ModuleAgent};
pub use handler::{ModuleHandler, StaticModule};
pub use server::AgentServer;
