use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

use switchyard_common::{unix_millis, InstanceId, ModuleType};

use crate::snapshot::{
    AggregatedMetrics, ControlPlaneMetrics, InstanceSample, LatencySummary, MetricSummary, RoutingStats,
};

/// One bucket per power of two microseconds: bucket `i` holds `[2^(i-1), 2^i)`.
const NUM_HISTOGRAM_BUCKETS: usize = 40;

/// Limits on what instances may report.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Custom metrics kept per instance; extra names are dropped.
    pub max_custom_metrics: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_custom_metrics: 64 }
    }
}

/// Log2-bucketed latency histogram with atomic bins.
///
/// Percentiles are reported as the upper bound of the bucket holding the
/// requested rank, so they over-estimate by at most 2x.
#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; NUM_HISTOGRAM_BUCKETS],
    total_us: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            total_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn bucket_for(latency_us: u64) -> usize {
        let bits = (u64::BITS - latency_us.leading_zeros()) as usize;
        bits.min(NUM_HISTOGRAM_BUCKETS - 1)
    }

    fn upper_bound(bucket: usize) -> u64 {
        if bucket == 0 {
            0
        } else {
            (1u64 << bucket) - 1
        }
    }

    fn record(&self, latency_us: u64) {
        self.buckets[Self::bucket_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, pct: u64, total: u64) -> u64 {
        let rank = ((total * pct) + 99) / 100;
        let mut seen = 0;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank.max(1) {
                return Self::upper_bound(idx);
            }
        }
        Self::upper_bound(NUM_HISTOGRAM_BUCKETS - 1)
    }

    fn summary(&self) -> LatencySummary {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            count,
            avg_us: self.total_us.load(Ordering::Relaxed) / count,
            p50_us: self.percentile(50, count),
            p95_us: self.percentile(95, count),
            p99_us: self.percentile(99, count),
        }
    }
}

#[derive(Debug, Default)]
struct TypeCounters {
    routed: AtomicU64,
    failed_dispatches: AtomicU64,
    fallbacks: AtomicU64,
    breaker_trips: AtomicU64,
}

impl TypeCounters {
    fn stats(&self) -> RoutingStats {
        RoutingStats {
            routed: self.routed.load(Ordering::Relaxed),
            failed_dispatches: self.failed_dispatches.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
        }
    }
}

/// Central store for reported instance metrics and routing counters.
///
/// Counters are atomics so the routing path never waits on a lock held by
/// an aggregation; samples sit behind an `RwLock` touched only by heartbeat
/// and report paths.
#[derive(Debug)]
pub struct MetricsRegistry {
    config: MetricsConfig,
    samples: StdRwLock<HashMap<InstanceId, InstanceSample>>,
    per_type: StdRwLock<HashMap<ModuleType, Arc<TypeCounters>>>,
    decisions: AtomicU64,
    not_found: AtomicU64,
    unhealthy: AtomicU64,
    rate_limited: AtomicU64,
    cache_hits: AtomicU64,
    can_handle_latency: LatencyHistogram,
    start_time: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            config,
            samples: StdRwLock::new(HashMap::new()),
            per_type: StdRwLock::new(HashMap::new()),
            decisions: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            unhealthy: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            can_handle_latency: LatencyHistogram::new(),
            start_time: Instant::now(),
        }
    }

    fn counters(&self, module_type: ModuleType) -> Arc<TypeCounters> {
        if let Ok(map) = self.per_type.read() {
            if let Some(c) = map.get(&module_type) {
                return c.clone();
            }
        }
        match self.per_type.write() {
            Ok(mut map) => map.entry(module_type).or_default().clone(),
            // poisoned: count into a throwaway rather than panic on the hot path
            Err(_) => Arc::new(TypeCounters::default()),
        }
    }

    fn cap_custom(&self, mut custom: HashMap<String, f64>) -> HashMap<String, f64> {
        custom.retain(|_, v| v.is_finite());
        if custom.len() > self.config.max_custom_metrics {
            let mut names: Vec<String> = custom.keys().cloned().collect();
            names.sort();
            for name in names.into_iter().skip(self.config.max_custom_metrics) {
                custom.remove(&name);
            }
        }
        custom
    }

    /// Replaces the sample for an instance (heartbeat path).
    pub fn record_sample(
        &self,
        instance_id: &InstanceId,
        module_type: ModuleType,
        load: f64,
        custom: HashMap<String, f64>,
    ) {
        let custom = self.cap_custom(custom);
        if let Ok(mut samples) = self.samples.write() {
            samples.insert(
                instance_id.clone(),
                InstanceSample {
                    instance_id: instance_id.clone(),
                    module_type,
                    load,
                    custom,
                    reported_at_ms: unix_millis(),
                },
            );
        }
    }

    /// Merges custom metrics into an instance's sample (`report_metrics` path).
    ///
    /// A `load` entry updates the load itself. Returns false when the
    /// instance has never heartbeated, leaving nothing recorded.
    pub fn merge_custom(&self, instance_id: &InstanceId, metrics: HashMap<String, f64>) -> bool {
        let Ok(mut samples) = self.samples.write() else {
            return false;
        };
        let Some(sample) = samples.get_mut(instance_id) else {
            return false;
        };
        for (name, value) in metrics {
            if !value.is_finite() {
                continue;
            }
            if name == switchyard_common::LOAD_METRIC {
                sample.load = value.clamp(0.0, 1.0);
            } else if sample.custom.len() < self.config.max_custom_metrics || sample.custom.contains_key(&name) {
                sample.custom.insert(name, value);
            }
        }
        sample.reported_at_ms = unix_millis();
        true
    }

    pub fn remove_instance(&self, instance_id: &InstanceId) {
        if let Ok(mut samples) = self.samples.write() {
            samples.remove(instance_id);
        }
    }

    pub fn sample(&self, instance_id: &InstanceId) -> Option<InstanceSample> {
        self.samples.read().ok()?.get(instance_id).cloned()
    }

    /// Load from the instance's latest heartbeat or report.
    pub fn load(&self, instance_id: &InstanceId) -> Option<f64> {
        self.samples.read().ok()?.get(instance_id).map(|s| s.load)
    }

    /// Average of `metric` across the given instances, skipping those without it.
    pub fn average(&self, instances: &[InstanceId], metric: &str) -> Option<f64> {
        let samples = self.samples.read().ok()?;
        let values: Vec<f64> = instances
            .iter()
            .filter_map(|id| samples.get(id))
            .filter_map(|s| s.value(metric))
            .collect();
        MetricSummary::from_values(&values).map(|s| s.avg)
    }

    /// Aggregates the samples of `instances` (callers pass the Healthy set).
    pub fn aggregate(&self, module_type: ModuleType, instances: &[InstanceId]) -> AggregatedMetrics {
        let mut loads = Vec::new();
        let mut custom: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        if let Ok(samples) = self.samples.read() {
            for sample in instances.iter().filter_map(|id| samples.get(id)) {
                if sample.module_type != module_type {
                    continue;
                }
                loads.push(sample.load);
                for (name, value) in &sample.custom {
                    custom.entry(name.clone()).or_default().push(*value);
                }
            }
        }

        AggregatedMetrics {
            module_type,
            instance_count: loads.len(),
            load: MetricSummary::from_values(&loads),
            custom: custom
                .into_iter()
                .filter_map(|(name, values)| MetricSummary::from_values(&values).map(|s| (name, s)))
                .collect(),
            routing: self.counters(module_type).stats(),
            generated_at_ms: unix_millis(),
        }
    }

    pub fn record_decision(&self) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unhealthy(&self) {
        self.unhealthy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_can_handle_latency(&self, latency_us: u64) {
        self.can_handle_latency.record(latency_us);
    }

    pub fn record_routed(&self, module_type: ModuleType) {
        self.counters(module_type).routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_dispatch(&self, module_type: ModuleType) {
        self.counters(module_type).failed_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, module_type: ModuleType) {
        self.counters(module_type).fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_trip(&self, module_type: ModuleType) {
        self.counters(module_type).breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> ControlPlaneMetrics {
        let per_type = self
            .per_type
            .read()
            .map(|map| map.iter().map(|(t, c)| (*t, c.stats())).collect())
            .unwrap_or_default();

        ControlPlaneMetrics {
            uptime_ms: self.uptime_ms(),
            decisions: self.decisions.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            unhealthy: self.unhealthy.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            can_handle_cache_hits: self.cache_hits.load(Ordering::Relaxed),
            can_handle_latency: self.can_handle_latency.summary(),
            per_type,
        }
    }
}
