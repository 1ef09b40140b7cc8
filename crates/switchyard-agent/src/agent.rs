//! Keeps one module instance registered with the control plane.

use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use switchyard_client::ControlPlaneClient;
use switchyard_common::methods::{HeartbeatResult, RegisterModuleResult};
use switchyard_common::{InstanceId, ModuleType, RegisterModuleRequest, Result, SwitchyardError, TrafficPattern};

use crate::handler::ModuleHandler;

/// Used until the control plane tells us its interval.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// host:port of the control plane
    pub control_plane: String,
    pub module_type: ModuleType,
    /// host:port this instance serves the module contract on
    pub address: String,
    pub capabilities: Vec<TrafficPattern>,
    pub version: String,
    /// Fixed id to register under. The control plane assigns one when unset.
    pub instance_id: Option<InstanceId>,
    /// Retries after a transient registration failure.
    pub register_retries: u32,
    pub retry_backoff: Duration,
    /// Overrides the interval returned at registration.
    pub heartbeat_interval: Option<Duration>,
}

impl AgentConfig {
    pub fn new(
        control_plane: impl Into<String>,
        module_type: ModuleType,
        address: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            control_plane: control_plane.into(),
            module_type,
            address: address.into(),
            capabilities: Vec::new(),
            version: version.into(),
            instance_id: None,
            register_retries: 5,
            retry_backoff: Duration::from_millis(200),
            heartbeat_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Registration {
    instance_id: InstanceId,
    interval: Duration,
}

/// Registers, heartbeats and deregisters on behalf of a [`ModuleHandler`].
///
/// Once registered the agent reuses its instance id, so a re-registration
/// after the control plane evicted it keeps the same identity.
pub struct ModuleAgent {
    config: AgentConfig,
    client: ControlPlaneClient,
    handler: Arc<dyn ModuleHandler>,
    registration: Mutex<Option<Registration>>,
    last_id: Mutex<Option<InstanceId>>,
}

impl ModuleAgent {
    pub fn new(config: AgentConfig, handler: Arc<dyn ModuleHandler>) -> Self {
        let client = ControlPlaneClient::new(config.control_plane.clone());
        let last_id = config.instance_id.clone();
        Self {
            config,
            client,
            handler,
            registration: Mutex::new(None),
            last_id: Mutex::new(last_id),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Id of the current registration, if registered.
    pub fn instance_id(&self) -> Option<InstanceId> {
        self.registration
            .lock()
            .ok()?
            .as_ref()
            .map(|r| r.instance_id.clone())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        if let Some(interval) = self.config.heartbeat_interval {
            return interval;
        }
        self.registration
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.interval))
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff.as_millis() as u64;
        let scaled = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = if scaled > 1 {
            rand::thread_rng().gen_range(0..=scaled / 2)
        } else {
            0
        };
        Duration::from_millis(scaled + jitter)
    }

    fn request(&self) -> RegisterModuleRequest {
        RegisterModuleRequest {
            instance_id: self.last_id.lock().ok().and_then(|id| id.clone()),
            module_type: self.config.module_type,
            address: self.config.address.clone(),
            capabilities: self.config.capabilities.clone(),
            version: self.config.version.clone(),
        }
    }

    /// Registers with the control plane, retrying transient failures
    /// (overload, transport errors, timeouts) with exponential backoff.
    pub async fn register(&self) -> Result<RegisterModuleResult> {
        let request = self.request();
        let mut attempt = 0;
        loop {
            match self.client.register_module(&request).await {
                Ok(result) => {
                    info!(
                        instance_id = %result.instance_id,
                        module_type = %self.config.module_type,
                        "registered with control plane at {}",
                        self.config.control_plane
                    );
                    let registration = Registration {
                        instance_id: result.instance_id.clone(),
                        interval: Duration::from_millis(result.heartbeat_interval_ms.max(1)),
                    };
                    if let Ok(mut last) = self.last_id.lock() {
                        *last = Some(result.instance_id.clone());
                    }
                    if let Ok(mut current) = self.registration.lock() {
                        *current = Some(registration);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_transient() && attempt < self.config.register_retries => {
                    let wait = self.backoff(attempt);
                    debug!(attempt, "registration failed ({}), retrying in {:?}", e, wait);
                    attempt += 1;
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!("registration failed after {} attempts: {}", attempt + 1, e);
                    return Err(e);
                }
            }
        }
    }

    /// Sends one heartbeat. Registers first when not registered, and
    /// re-registers once when the control plane no longer knows the id.
    pub async fn heartbeat_once(&self) -> Result<HeartbeatResult> {
        let instance_id = match self.instance_id() {
            Some(id) => id,
            None => self.register().await?.instance_id,
        };
        match self.send_heartbeat(instance_id).await {
            Err(SwitchyardError::NotFound(_)) => {
                warn!("control plane dropped this instance, re-registering");
                self.clear_registration();
                let instance_id = self.register().await?.instance_id;
                self.send_heartbeat(instance_id).await
            }
            other => other,
        }
    }

    async fn send_heartbeat(&self, instance_id: InstanceId) -> Result<HeartbeatResult> {
        self.client
            .heartbeat(instance_id, self.handler.current_load(), self.handler.custom_metrics())
            .await
    }

    fn clear_registration(&self) -> Option<Registration> {
        self.registration.lock().ok().and_then(|mut r| r.take())
    }

    /// Removes this instance from the control plane. Already being unknown
    /// to the control plane counts as success.
    pub async fn deregister(&self) -> Result<()> {
        let Some(registration) = self.clear_registration() else {
            return Ok(());
        };
        match self.client.unregister_module(registration.instance_id.clone()).await {
            Ok(_) | Err(SwitchyardError::NotFound(_)) => {
                info!(instance_id = %registration.instance_id, "deregistered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Registers and heartbeats until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        loop {
            let result = match self.instance_id() {
                None => self.register().await.map(|_| ()),
                Some(_) => self.heartbeat_once().await.map(|result| {
                    debug!(status = %result.health_status, "heartbeat acknowledged");
                }),
            };
            if let Err(e) = result {
                warn!("control plane unreachable: {}", e);
            }
            tokio::time::sleep(self.heartbeat_interval()).await;
        }
    }
}
