//! Short-lived cache of CanHandle answers.
//!
//! Under steady traffic the same (instance, pattern) pair is asked many times
//! a second; answers younger than the TTL are reused instead of fanning out.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use switchyard_common::{CanHandleResponse, InstanceId, TrafficPattern};

#[derive(Debug)]
pub struct CanHandleCache {
    ttl: Duration,
    entries: DashMap<(InstanceId, TrafficPattern), (CanHandleResponse, Instant)>,
}

impl CanHandleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, instance_id: &InstanceId, pattern: &TrafficPattern, now: Instant) -> Option<CanHandleResponse> {
        if self.ttl.is_zero() {
            return None;
        }
        let key = (instance_id.clone(), pattern.clone());
        let entry = self.entries.get(&key)?;
        let (answer, at) = *entry;
        if now.saturating_duration_since(at) < self.ttl {
            Some(answer)
        } else {
            None
        }
    }

    pub fn insert(&self, instance_id: InstanceId, pattern: TrafficPattern, answer: CanHandleResponse, now: Instant) {
        if !self.ttl.is_zero() {
            self.entries.insert((instance_id, pattern), (answer, now));
        }
    }

    pub fn evict_instance(&self, instance_id: &InstanceId) {
        self.entries.retain(|(id, _), _| id != instance_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drops expired answers, returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
