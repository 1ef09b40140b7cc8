//! Switchyard Metrics
//!
//! - [`MetricsRegistry`] stores the latest metrics each instance reported
//!   (heartbeat load plus custom `name -> f64` values), aggregates them per
//!   module type, and keeps lock-free routing counters and a CanHandle
//!   latency histogram.
//! - [`MetricsSink`] is the export collaborator the heartbeat monitor and
//!   scaling controller publish aggregated numbers and alerts to.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use switchyard_common::{InstanceId, ModuleType};
//! use switchyard_metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new();
//! let id = InstanceId::from("alb-000001");
//! registry.record_sample(&id, ModuleType::ApplicationBalancer, 0.4, HashMap::new());
//! let agg = registry.aggregate(ModuleType::ApplicationBalancer, &[id]);
//! assert_eq!(agg.instance_count, 1);
//! ```

pub mod registry;
pub mod sink;
pub mod snapshot;

pub use registry::{MetricsConfig, MetricsRegistry};
pub use sink::{MemoryMetricsSink, MetricsSink, NoopMetricsSink, TracingMetricsSink};
pub use snapshot::{AggregatedMetrics, ControlPlaneMetrics, InstanceSample, LatencySummary, MetricSummary, RoutingStats};
