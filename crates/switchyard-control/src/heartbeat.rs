//! Heartbeat Monitor
//!
//! Feeds heartbeats and metric reports into the registry and the metrics
//! store, and runs the periodic health sweep. The sweep itself is applied by
//! the registry writer; this side cleans up whatever else was keyed by the
//! removed instances and pushes aggregates to the metrics sink.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use switchyard_common::methods::InstanceProbe;
use switchyard_common::rate_limit::RateLimiter;
use switchyard_common::{InstanceId, ModuleClient, Result, SwitchyardError};
use switchyard_metrics::{MetricsRegistry, MetricsSink};

use crate::cache::CanHandleCache;
use crate::circuit_breaker::CircuitBreakers;
use crate::config::HeartbeatConfig;
use crate::registry::{HeartbeatAck, RegistryHandle, SweepReport};

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    registry: RegistryHandle,
    metrics: Arc<MetricsRegistry>,
    breakers: Arc<CircuitBreakers>,
    cache: Arc<CanHandleCache>,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn MetricsSink>,
    modules: Arc<dyn ModuleClient>,
    sweeps: AtomicU64,
}

fn finite(mut metrics: HashMap<String, f64>) -> HashMap<String, f64> {
    metrics.retain(|_, v| v.is_finite());
    metrics
}

impl HeartbeatMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HeartbeatConfig,
        registry: RegistryHandle,
        metrics: Arc<MetricsRegistry>,
        breakers: Arc<CircuitBreakers>,
        cache: Arc<CanHandleCache>,
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn MetricsSink>,
        modules: Arc<dyn ModuleClient>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            breakers,
            cache,
            limiter,
            sink,
            modules,
            sweeps: AtomicU64::new(0),
        }
    }

    /// Applies a heartbeat, then stores its metrics.
    pub async fn ingest(
        &self,
        instance_id: InstanceId,
        load: f64,
        custom_metrics: HashMap<String, f64>,
    ) -> Result<HeartbeatAck> {
        let custom_metrics = finite(custom_metrics);
        let ack = self
            .registry
            .heartbeat(instance_id.clone(), load, custom_metrics.clone())
            .await?;
        self.metrics
            .record_sample(&instance_id, ack.module_type, ack.load, custom_metrics);
        Ok(ack)
    }

    /// Out-of-band metric report. Does not count as a heartbeat.
    pub async fn report_metrics(&self, instance_id: InstanceId, metrics: HashMap<String, f64>) -> Result<()> {
        let info = self.registry.get(instance_id.clone()).await?;
        let metrics = finite(metrics);
        if !self.metrics.merge_custom(&instance_id, metrics.clone()) {
            self.metrics
                .record_sample(&instance_id, info.module_type, info.current_load, metrics);
        }
        Ok(())
    }

    /// One sweep pass.
    pub async fn sweep_once(&self, now: Instant) -> Result<SweepReport> {
        let report = self.registry.sweep().await?;

        for id in &report.demoted {
            self.cache.evict_instance(id);
        }
        for id in &report.removed {
            self.metrics.remove_instance(id);
            self.breakers.remove(id);
            self.cache.evict_instance(id);
        }
        if !report.is_empty() {
            info!(
                demoted = report.demoted.len(),
                recovered = report.recovered.len(),
                removed = report.removed.len(),
                generation = report.generation,
                "health sweep"
            );
        }

        let stale_buckets = self.limiter.cleanup_stale(now);
        let expired_answers = self.cache.purge_expired(now);
        if stale_buckets > 0 || expired_answers > 0 {
            debug!(stale_buckets, expired_answers, "sweep cleanup");
        }

        let sweeps = self.sweeps.fetch_add(1, Ordering::Relaxed) + 1;
        let every = u64::from(self.config.publish_every_sweeps.max(1));
        if sweeps % every == 0 {
            self.publish();
        }
        Ok(report)
    }

    /// Pushes per-type aggregates over Healthy instances to the sink.
    pub fn publish(&self) {
        let snapshot = self.registry.snapshot();
        for module_type in snapshot.module_types() {
            let aggregated = self.metrics.aggregate(module_type, &snapshot.healthy_ids(module_type));
            self.sink.publish(&aggregated);
        }
    }

    /// Probes every Healthy instance in parallel, each bounded by the probe timeout.
    pub async fn probe(&self, deep: bool) -> Vec<InstanceProbe> {
        let snapshot = self.registry.snapshot();
        let deadline = self.config.probe_timeout();

        let checks = snapshot
            .module_types()
            .flat_map(|t| snapshot.healthy(t).iter())
            .map(|instance| async move {
                let call = async {
                    if deep {
                        self.modules.deep_health_check(&instance.address, deadline).await
                    } else {
                        self.modules.health_check(&instance.address, deadline).await
                    }
                };
                let result = match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(SwitchyardError::Timeout(deadline.as_millis() as u64)),
                };
                match result {
                    Ok(report) => InstanceProbe {
                        instance_id: instance.instance_id.clone(),
                        report: Some(report),
                        error: None,
                    },
                    Err(e) => {
                        debug!(instance_id = %instance.instance_id, "health probe failed: {}", e);
                        InstanceProbe {
                            instance_id: instance.instance_id.clone(),
                            report: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            });

        join_all(checks).await
    }

    /// Starts the sweep loop; it ends when the registry writer stops.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.sweep_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match monitor.sweep_once(Instant::now()).await {
                    Ok(_) => {}
                    Err(SwitchyardError::Shutdown) => break,
                    Err(e) => warn!("health sweep failed: {}", e),
                }
            }
            info!("heartbeat monitor stopped");
        })
    }
}
