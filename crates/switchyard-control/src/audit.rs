//! Append-only audit trail.
//!
//! Registry membership and health changes, scaling actions and deployment
//! transitions are each written here as one [`AuditEvent`]. The sink is
//! synchronous and must not block: the registry writer calls it inline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use switchyard_common::unix_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditCategory {
    Registry,
    Routing,
    Scaling,
    Deployment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at_ms: u64,
    pub category: AuditCategory,
    pub action: String,
    /// Instance id or module type the event is about.
    pub subject: String,
    #[serde(default)]
    pub detail: Value,
}

impl AuditEvent {
    pub fn new(category: AuditCategory, action: impl Into<String>, subject: impl ToString) -> Self {
        Self {
            at_ms: unix_millis(),
            category,
            action: action.into(),
            subject: subject.to_string(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits every event as a structured `info` log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            target: "switchyard::audit",
            category = ?event.category,
            action = %event.action,
            subject = %event.subject,
            detail = %event.detail,
            "audit"
        );
    }
}

/// Bounded in-memory ring, newest last.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn by_category(&self, category: AuditCategory) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|e| e.category == category).collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_sink_is_bounded() {
        let sink = MemoryAuditSink::new(2);
        for i in 0..3 {
            sink.record(AuditEvent::new(AuditCategory::Registry, "registered", format!("alb-{}", i)));
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].subject, "alb-1");
        assert_eq!(events[1].subject, "alb-2");
    }

    #[test]
    fn test_filter_by_category() {
        let sink = MemoryAuditSink::default();
        sink.record(AuditEvent::new(AuditCategory::Scaling, "scaled_up", "application-balancer"));
        sink.record(
            AuditEvent::new(AuditCategory::Deployment, "canary_started", "application-balancer")
                .with_detail(json!({"weight": 10})),
        );
        let deployments = sink.by_category(AuditCategory::Deployment);
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].detail["weight"], 10);
    }
}
