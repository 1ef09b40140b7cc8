//! The module contract, seen from the module's side.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use tracing::info;

use switchyard_common::{
    CanHandleResponse, HealthReport, ModuleStatus, ModuleType, Result, ScaleAck, SwitchyardError, TrafficPattern,
};

/// What a module instance answers when the control plane calls it.
#[async_trait]
pub trait ModuleHandler: Send + Sync {
    async fn get_status(&self) -> Result<ModuleStatus>;

    async fn can_handle(&self, pattern: &TrafficPattern) -> Result<CanHandleResponse>;

    async fn scale(&self, target_replicas: u32) -> Result<ScaleAck>;

    async fn set_traffic_weight(&self, version: &str, weight: u8) -> Result<()>;

    async fn get_active_version(&self) -> Result<String>;

    async fn rollback(&self) -> Result<()>;

    async fn health_check(&self) -> Result<HealthReport>;

    async fn deep_health_check(&self) -> Result<HealthReport> {
        self.health_check().await
    }

    /// Load reported with each heartbeat, 0..=1.
    fn current_load(&self) -> f64;

    fn custom_metrics(&self) -> HashMap<String, f64> {
        HashMap::new()
    }
}

/// In-memory module whose answers are set by the embedding program.
///
/// `can_handle` answers the configured priority for patterns covered by one
/// of its capabilities and priority 0 otherwise.
#[derive(Debug)]
pub struct StaticModule {
    module_type: ModuleType,
    version: String,
    capabilities: Vec<TrafficPattern>,
    priority: AtomicU8,
    load_bits: AtomicU64,
    replicas: AtomicU32,
    healthy: AtomicBool,
    weights: Mutex<BTreeMap<String, u8>>,
    metrics: Mutex<HashMap<String, f64>>,
    rollbacks: AtomicU32,
}

impl StaticModule {
    pub fn new(module_type: ModuleType, version: impl Into<String>, capabilities: Vec<TrafficPattern>) -> Self {
        let capabilities = if capabilities.is_empty() {
            module_type.default_capabilities()
        } else {
            capabilities
        };
        Self {
            module_type,
            version: version.into(),
            capabilities,
            priority: AtomicU8::new(50),
            load_bits: AtomicU64::new(0f64.to_bits()),
            replicas: AtomicU32::new(1),
            healthy: AtomicBool::new(true),
            weights: Mutex::new(BTreeMap::new()),
            metrics: Mutex::new(HashMap::new()),
            rollbacks: AtomicU32::new(0),
        }
    }

    pub fn module_type(&self) -> ModuleType {
        self.module_type
    }

    pub fn capabilities(&self) -> &[TrafficPattern] {
        &self.capabilities
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority.min(100), Ordering::Relaxed);
    }

    pub fn set_load(&self, load: f64) {
        self.load_bits.store(load.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_metric(&self, name: impl Into<String>, value: f64) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.insert(name.into(), value);
        }
    }

    pub fn replicas(&self) -> u32 {
        self.replicas.load(Ordering::Relaxed)
    }

    /// Weight last pushed for `version`, if any.
    pub fn weight(&self, version: &str) -> Option<u8> {
        self.weights.lock().ok()?.get(version).copied()
    }

    pub fn rollbacks(&self) -> u32 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl ModuleHandler for StaticModule {
    async fn get_status(&self) -> Result<ModuleStatus> {
        Ok(ModuleStatus {
            healthy: self.healthy.load(Ordering::Relaxed),
            version: self.version.clone(),
            load: self.load(),
            replicas: Some(self.replicas()),
        })
    }

    async fn can_handle(&self, pattern: &TrafficPattern) -> Result<CanHandleResponse> {
        let covered = self.capabilities.iter().any(|c| c.matches(pattern));
        Ok(CanHandleResponse {
            priority: if covered { self.priority.load(Ordering::Relaxed) } else { 0 },
            load: self.load(),
        })
    }

    async fn scale(&self, target_replicas: u32) -> Result<ScaleAck> {
        if target_replicas == 0 {
            return Err(SwitchyardError::InvalidRequest("target_replicas must be at least 1".into()));
        }
        let previous = self.replicas.swap(target_replicas, Ordering::Relaxed);
        info!(module_type = %self.module_type, "scaled {} -> {} replicas", previous, target_replicas);
        Ok(ScaleAck {
            accepted: true,
            replicas: target_replicas,
        })
    }

    async fn set_traffic_weight(&self, version: &str, weight: u8) -> Result<()> {
        if weight > 100 {
            return Err(SwitchyardError::InvalidWeight {
                stable: u32::from(weight),
                candidate: 0,
            });
        }
        if let Ok(mut weights) = self.weights.lock() {
            weights.insert(version.to_string(), weight);
        }
        Ok(())
    }

    async fn get_active_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    async fn rollback(&self) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut weights) = self.weights.lock() {
            weights.clear();
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthReport> {
        Ok(HealthReport {
            healthy: self.healthy.load(Ordering::Relaxed),
            detail: None,
        })
    }

    async fn deep_health_check(&self) -> Result<HealthReport> {
        let healthy = self.healthy.load(Ordering::Relaxed);
        Ok(HealthReport {
            healthy,
            detail: Some(format!(
                "{} {} replicas={} load={:.2}",
                self.module_type,
                self.version,
                self.replicas(),
                self.load()
            )),
        })
    }

    fn current_load(&self) -> f64 {
        self.load()
    }

    fn custom_metrics(&self) -> HashMap<String, f64> {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}
