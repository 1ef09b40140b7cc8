pub mod deployment;
pub mod error;
pub mod jsonrpc;
pub mod methods;
pub mod routing;
pub mod scaling;
pub mod types;

pub use deployment::*;
pub use error::{Result, SwitchyardError};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use routing::*;
pub use scaling::*;
pub use types::*;

/// Milliseconds since the Unix epoch, used for wall-clock fields on the wire.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
