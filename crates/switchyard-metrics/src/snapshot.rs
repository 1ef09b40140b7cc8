// Copyright 2025 Switchyard Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use switchyard_common::{InstanceId, ModuleType};

/// Latest metrics reported by one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSample {
    pub instance_id: InstanceId,
    pub module_type: ModuleType,
    pub load: f64,
    pub custom: HashMap<String, f64>,
    pub reported_at_ms: u64,
}

impl InstanceSample {
    /// Value of `name`, where `load` is the heartbeat load.
    pub fn value(&self, name: &str) -> Option<f64> {
        if name == switchyard_common::LOAD_METRIC {
            Some(self.load)
        } else {
            self.custom.get(name).copied()
        }
    }
}

/// avg/min/max over a set of instances
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

impl MetricSummary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            avg: sum / values.len() as f64,
            min,
            max,
            samples: values.len(),
        })
    }
}

/// Routing counters for one module type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingStats {
    pub routed: u64,
    pub failed_dispatches: u64,
    pub fallbacks: u64,
    pub breaker_trips: u64,
}

/// Answer to `get_aggregated_metrics(module_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub module_type: ModuleType,
    /// Instances contributing samples (Healthy instances only).
    pub instance_count: usize,
    pub load: Option<MetricSummary>,
    pub custom: BTreeMap<String, MetricSummary>,
    pub routing: RoutingStats,
    pub generated_at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Control-plane wide counters, part of `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneMetrics {
    pub uptime_ms: u64,
    pub decisions: u64,
    pub not_found: u64,
    pub unhealthy: u64,
    pub rate_limited: u64,
    pub can_handle_cache_hits: u64,
    pub can_handle_latency: LatencySummary,
    pub per_type: BTreeMap<ModuleType, RoutingStats>,
}
