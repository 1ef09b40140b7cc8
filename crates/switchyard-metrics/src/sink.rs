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

use std::sync::Mutex;

use switchyard_common::ModuleType;

use crate::snapshot::AggregatedMetrics;

/// Export collaborator for aggregated numbers and alert conditions.
///
/// Called from background loops only, never from the routing path.
/// Implementations must not block; buffer and ship elsewhere if needed.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, metrics: &AggregatedMetrics);

    /// An operator-facing alert, e.g. a scale command that kept failing.
    fn alert(&self, module_type: ModuleType, message: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn publish(&self, _metrics: &AggregatedMetrics) {}

    fn alert(&self, _module_type: ModuleType, _message: &str) {}
}

/// Writes aggregates at debug level and alerts at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn publish(&self, metrics: &AggregatedMetrics) {
        tracing::debug!(
            module_type = %metrics.module_type,
            instances = metrics.instance_count,
            avg_load = metrics.load.map(|l| l.avg).unwrap_or(0.0),
            routed = metrics.routing.routed,
            "aggregated metrics"
        );
    }

    fn alert(&self, module_type: ModuleType, message: &str) {
        tracing::warn!(module_type = %module_type, "alert: {}", message);
    }
}

/// Keeps everything in memory; handy for tests and the status page.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    published: Mutex<Vec<AggregatedMetrics>>,
    alerts: Mutex<Vec<(ModuleType, String)>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<AggregatedMetrics> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<(ModuleType, String)> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn publish(&self, metrics: &AggregatedMetrics) {
        if let Ok(mut published) = self.published.lock() {
            published.push(metrics.clone());
        }
    }

    fn alert(&self, module_type: ModuleType, message: &str) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push((module_type, message.to_string()));
        }
    }
}
