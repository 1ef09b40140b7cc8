//! The contract the control plane speaks to module instances.
//!
//! Every module kind implements the same operations, so the control plane
//! only ever holds a `dyn ModuleClient` and an instance address. Each call
//! carries its own deadline; implementations must give up with
//! [`SwitchyardError::Timeout`](crate::SwitchyardError::Timeout) when it
//! expires rather than hang the caller.

use async_trait::async_trait;
use std::time::Duration;

use crate::protocol::error::Result;
use crate::protocol::types::{CanHandleResponse, HealthReport, ModuleStatus, ScaleAck, TrafficPattern};

#[async_trait]
pub trait ModuleClient: Send + Sync {
    async fn get_status(&self, address: &str, deadline: Duration) -> Result<ModuleStatus>;

    /// Asks how willing the instance is to take `pattern`.
    async fn can_handle(
        &self,
        address: &str,
        pattern: &TrafficPattern,
        deadline: Duration,
    ) -> Result<CanHandleResponse>;

    async fn scale(&self, address: &str, target_replicas: u32, deadline: Duration) -> Result<ScaleAck>;

    async fn set_traffic_weight(
        &self,
        address: &str,
        version: &str,
        weight: u8,
        deadline: Duration,
    ) -> Result<()>;

    async fn get_active_version(&self, address: &str, deadline: Duration) -> Result<String>;

    async fn rollback(&self, address: &str, deadline: Duration) -> Result<()>;

    async fn health_check(&self, address: &str, deadline: Duration) -> Result<HealthReport>;

    /// Optional deeper probe; defaults to the shallow check.
    async fn deep_health_check(&self, address: &str, deadline: Duration) -> Result<HealthReport> {
        self.health_check(address, deadline).await
    }
}
