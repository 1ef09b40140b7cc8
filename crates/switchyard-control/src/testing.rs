//! Scripted [`ModuleClient`] for tests and benchmarks.
//!
//! Answers are configured per instance address; every scale, weight and
//! rollback command is recorded so tests can assert on what was sent.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use switchyard_common::{
    CanHandleResponse, HealthReport, ModuleClient, ModuleStatus, Result, ScaleAck, SwitchyardError, TrafficPattern,
};

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Answer(CanHandleResponse),
    /// Connection refused on every call.
    Refuse,
    /// Never answers; the caller's deadline expires.
    Hang,
}

#[derive(Debug, Default)]
pub struct MockModuleClient {
    behavior: Mutex<HashMap<String, Behavior>>,
    versions: Mutex<HashMap<String, String>>,
    reject_scale: Mutex<HashSet<String>>,
    can_handle_calls: AtomicUsize,
    scale_calls: Mutex<Vec<(String, u32)>>,
    weight_calls: Mutex<Vec<(String, String, u8)>>,
    rollback_calls: Mutex<Vec<String>>,
}

impl MockModuleClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, address: &str, behavior: Behavior) {
        if let Ok(mut map) = self.behavior.lock() {
            map.insert(address.to_string(), behavior);
        }
    }

    fn behavior(&self, address: &str) -> Option<Behavior> {
        self.behavior.lock().ok()?.get(address).copied()
    }

    pub fn answer(&self, address: &str, priority: u8, load: f64) {
        self.set(address, Behavior::Answer(CanHandleResponse { priority, load }));
    }

    pub fn refuse(&self, address: &str) {
        self.set(address, Behavior::Refuse);
    }

    pub fn hang(&self, address: &str) {
        self.set(address, Behavior::Hang);
    }

    pub fn set_version(&self, address: &str, version: &str) {
        if let Ok(mut map) = self.versions.lock() {
            map.insert(address.to_string(), version.to_string());
        }
    }

    /// Scale commands to `address` are answered with `accepted: false`.
    pub fn reject_scale(&self, address: &str) {
        if let Ok(mut set) = self.reject_scale.lock() {
            set.insert(address.to_string());
        }
    }

    pub fn can_handle_calls(&self) -> usize {
        self.can_handle_calls.load(Ordering::SeqCst)
    }

    pub fn scale_calls(&self) -> Vec<(String, u32)> {
        self.scale_calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn weight_calls(&self) -> Vec<(String, String, u8)> {
        self.weight_calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn rollback_calls(&self) -> Vec<String> {
        self.rollback_calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn reachable(&self, address: &str, deadline: Duration) -> Result<()> {
        match self.behavior(address) {
            Some(Behavior::Refuse) => Err(SwitchyardError::Transport(format!("{} refused connection", address))),
            Some(Behavior::Hang) => {
                tokio::time::sleep(deadline).await;
                Err(SwitchyardError::Timeout(deadline.as_millis() as u64))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ModuleClient for MockModuleClient {
    async fn get_status(&self, address: &str, deadline: Duration) -> Result<ModuleStatus> {
        self.reachable(address, deadline).await?;
        Ok(ModuleStatus {
            healthy: true,
            version: self.get_active_version(address, deadline).await?,
            load: 0.0,
            replicas: None,
        })
    }

    async fn can_handle(
        &self,
        address: &str,
        _pattern: &TrafficPattern,
        deadline: Duration,
    ) -> Result<CanHandleResponse> {
        self.can_handle_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable(address, deadline).await?;
        match self.behavior(address) {
            Some(Behavior::Answer(answer)) => Ok(answer),
            _ => Ok(CanHandleResponse { priority: 50, load: 0.5 }),
        }
    }

    async fn scale(&self, address: &str, target_replicas: u32, deadline: Duration) -> Result<ScaleAck> {
        self.reachable(address, deadline).await?;
        if let Ok(mut calls) = self.scale_calls.lock() {
            calls.push((address.to_string(), target_replicas));
        }
        let rejected = self
            .reject_scale
            .lock()
            .map(|set| set.contains(address))
            .unwrap_or(false);
        Ok(ScaleAck {
            accepted: !rejected,
            replicas: target_replicas,
        })
    }

    async fn set_traffic_weight(&self, address: &str, version: &str, weight: u8, deadline: Duration) -> Result<()> {
        self.reachable(address, deadline).await?;
        if let Ok(mut calls) = self.weight_calls.lock() {
            calls.push((address.to_string(), version.to_string(), weight));
        }
        Ok(())
    }

    async fn get_active_version(&self, address: &str, deadline: Duration) -> Result<String> {
        self.reachable(address, deadline).await?;
        Ok(self
            .versions
            .lock()
            .ok()
            .and_then(|v| v.get(address).cloned())
            .unwrap_or_else(|| "v1".to_string()))
    }

    async fn rollback(&self, address: &str, deadline: Duration) -> Result<()> {
        self.reachable(address, deadline).await?;
        if let Ok(mut calls) = self.rollback_calls.lock() {
            calls.push(address.to_string());
        }
        Ok(())
    }

    async fn health_check(&self, address: &str, deadline: Duration) -> Result<HealthReport> {
        self.reachable(address, deadline).await?;
        Ok(HealthReport {
            healthy: true,
            detail: None,
        })
    }

    async fn deep_health_check(&self, address: &str, deadline: Duration) -> Result<HealthReport> {
        self.reachable(address, deadline).await?;
        Ok(HealthReport {
            healthy: true,
            detail: Some("deep probe ok".to_string()),
        })
    }
}
