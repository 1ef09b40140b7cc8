//! Immutable, versioned routing snapshots.
//!
//! The registry writer builds a new [`RoutingSnapshot`] after every
//! membership, health or route change and publishes it with a single
//! pointer swap. Readers hold an `Arc` to whichever snapshot was current
//! when they looked and never observe a partial update.

use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use switchyard_common::{
    unix_millis, HealthStatus, InstanceId, ModuleType, Route, RouteEntryView, RoutingTableView, TrafficPattern,
};

use crate::instance::ModuleInstance;

/// What the routing path needs to know about an eligible instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInstance {
    pub instance_id: InstanceId,
    pub module_type: ModuleType,
    pub address: String,
    pub version: String,
    /// Load as of the snapshot build. Heartbeats that leave health alone do
    /// not republish, so the routing path prefers the live metric sample.
    pub load: f64,
}

impl SnapshotInstance {
    fn from_instance(instance: &ModuleInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            module_type: instance.module_type,
            address: instance.address.clone(),
            version: instance.version.clone(),
            load: instance.current_load,
        }
    }
}

/// An enabled route joined with the Healthy instances that serve it.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub route: Route,
    /// Sorted by instance id.
    pub instances: Vec<SnapshotInstance>,
}

/// Per-module-type membership counts.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    pub registered: usize,
    /// Healthy instances, sorted by id.
    pub healthy: Vec<SnapshotInstance>,
}

#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    pub generation: u64,
    pub built_at: Instant,
    pub built_at_ms: u64,
    /// Every configured route, including disabled ones.
    pub routes: Vec<Route>,
    pub entries: Vec<RouteEntry>,
    pub membership: BTreeMap<ModuleType, Membership>,
}

impl RoutingSnapshot {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            built_at: Instant::now(),
            built_at_ms: unix_millis(),
            routes: Vec::new(),
            entries: Vec::new(),
            membership: BTreeMap::new(),
        }
    }

    /// Joins enabled routes with Healthy instances.
    pub fn build<'a>(
        generation: u64,
        routes: &[Route],
        instances: impl IntoIterator<Item = &'a ModuleInstance>,
    ) -> Self {
        let mut membership: BTreeMap<ModuleType, Membership> = BTreeMap::new();
        let mut healthy: Vec<&ModuleInstance> = Vec::new();

        for instance in instances {
            let m = membership.entry(instance.module_type).or_default();
            m.registered += 1;
            if instance.health_status == HealthStatus::Healthy {
                m.healthy.push(SnapshotInstance::from_instance(instance));
                healthy.push(instance);
            }
        }
        for m in membership.values_mut() {
            m.healthy.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        }
        healthy.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let entries = routes
            .iter()
            .filter(|r| r.enabled)
            .map(|route| RouteEntry {
                route: route.clone(),
                instances: healthy
                    .iter()
                    .filter(|i| i.module_type == route.target_module_type && i.serves(&route.pattern))
                    .map(|i| SnapshotInstance::from_instance(i))
                    .collect(),
            })
            .collect();

        Self {
            generation,
            built_at: Instant::now(),
            built_at_ms: unix_millis(),
            routes: routes.to_vec(),
            entries,
            membership,
        }
    }

    /// Enabled routes whose pattern covers the request.
    pub fn matching<'s>(&'s self, request: &'s TrafficPattern) -> impl Iterator<Item = &'s RouteEntry> + 's {
        self.entries.iter().filter(move |e| e.route.pattern.matches(request))
    }

    pub fn healthy(&self, module_type: ModuleType) -> &[SnapshotInstance] {
        self.membership
            .get(&module_type)
            .map(|m| m.healthy.as_slice())
            .unwrap_or(&[])
    }

    pub fn healthy_ids(&self, module_type: ModuleType) -> Vec<InstanceId> {
        self.healthy(module_type).iter().map(|i| i.instance_id.clone()).collect()
    }

    pub fn registered_count(&self, module_type: ModuleType) -> usize {
        self.membership.get(&module_type).map(|m| m.registered).unwrap_or(0)
    }

    pub fn total_registered(&self) -> usize {
        self.membership.values().map(|m| m.registered).sum()
    }

    pub fn total_healthy(&self) -> usize {
        self.membership.values().map(|m| m.healthy.len()).sum()
    }

    pub fn module_types(&self) -> impl Iterator<Item = ModuleType> + '_ {
        self.membership.keys().copied()
    }

    pub fn view(&self) -> RoutingTableView {
        RoutingTableView {
            generation: self.generation,
            built_at_ms: self.built_at_ms,
            entries: self
                .entries
                .iter()
                .map(|e| RouteEntryView {
                    route: e.route.clone(),
                    instances: e.instances.iter().map(|i| i.instance_id.clone()).collect(),
                })
                .collect(),
        }
    }
}

/// Shared publication point for snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotCell {
    inner: Arc<ArcSwap<RoutingSnapshot>>,
    published: Arc<watch::Sender<u64>>,
}

impl SnapshotCell {
    pub fn new(initial: RoutingSnapshot) -> Self {
        let (published, _) = watch::channel(initial.generation);
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
            published: Arc::new(published),
        }
    }

    /// O(1), never blocks.
    pub fn load(&self) -> Arc<RoutingSnapshot> {
        self.inner.load_full()
    }

    pub(crate) fn publish(&self, snapshot: RoutingSnapshot) {
        let generation = snapshot.generation;
        self.inner.store(Arc::new(snapshot));
        self.published.send_replace(generation);
    }

    /// Notified with the generation of every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.published.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use switchyard_common::RegisterModuleRequest;

    fn instance(id: &str, t: ModuleType, caps: &[&str], health: HealthStatus) -> ModuleInstance {
        let mut i = ModuleInstance::new(
            InstanceId::from(id),
            RegisterModuleRequest {
                instance_id: None,
                module_type: t,
                address: format!("{}:9000", id),
                capabilities: caps.iter().map(|c| c.parse().unwrap()).collect(),
                version: "v1".into(),
            },
            Instant::now(),
        );
        if health != HealthStatus::Unknown {
            i.apply_heartbeat(0.3, HashMap::new(), 0.95, Instant::now());
            i.health_status = health;
        }
        i
    }

    #[test]
    fn test_build_includes_only_healthy_serving_instances() {
        let routes = vec![
            Route::new("tcp:443".parse().unwrap(), ModuleType::ApplicationBalancer, 50),
            Route::new("tcp:443".parse().unwrap(), ModuleType::NetworkBalancer, 40).disabled(),
        ];
        let instances = vec![
            instance("alb-2", ModuleType::ApplicationBalancer, &["tcp:443"], HealthStatus::Healthy),
            instance("alb-1", ModuleType::ApplicationBalancer, &["tcp:443"], HealthStatus::Healthy),
            instance("alb-3", ModuleType::ApplicationBalancer, &["tcp:443"], HealthStatus::Unhealthy),
            instance("alb-4", ModuleType::ApplicationBalancer, &["tcp:80"], HealthStatus::Healthy),
            instance("nlb-1", ModuleType::NetworkBalancer, &["tcp:443"], HealthStatus::Healthy),
        ];

        let snap = RoutingSnapshot::build(7, &routes, &instances);
        assert_eq!(snap.generation, 7);
        assert_eq!(snap.entries.len(), 1);
        let ids: Vec<&str> = snap.entries[0].instances.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["alb-1", "alb-2"]);

        assert_eq!(snap.registered_count(ModuleType::ApplicationBalancer), 4);
        assert_eq!(snap.healthy(ModuleType::ApplicationBalancer).len(), 3);
        assert_eq!(snap.total_registered(), 5);
        assert_eq!(snap.routes.len(), 2);
    }

    #[test]
    fn test_matching_by_path_prefix() {
        let routes = vec![
            Route::new("http:80/api".parse().unwrap(), ModuleType::ApplicationBalancer, 50),
            Route::new("http:80".parse().unwrap(), ModuleType::EgressProxy, 10),
        ];
        let snap = RoutingSnapshot::build(1, &routes, std::iter::empty());

        let api: TrafficPattern = "http:80/api/users".parse().unwrap();
        assert_eq!(snap.matching(&api).count(), 2);
        let other: TrafficPattern = "http:80/static".parse().unwrap();
        let matched: Vec<_> = snap.matching(&other).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].route.target_module_type, ModuleType::EgressProxy);
    }

    #[test]
    fn test_cell_publish_replaces_whole_snapshot() {
        let cell = SnapshotCell::new(RoutingSnapshot::empty());
        let held = cell.load();
        cell.publish(RoutingSnapshot::build(2, &[], std::iter::empty()));
        assert_eq!(held.generation, 0);
        assert_eq!(cell.load().generation, 2);
    }

    #[test]
    fn test_publish_notifies_subscribers() {
        let cell = SnapshotCell::new(RoutingSnapshot::empty());
        let mut rx = cell.subscribe();
        assert!(!rx.has_changed().unwrap());
        cell.publish(RoutingSnapshot::build(5, &[], std::iter::empty()));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 5);
    }

    #[test]
    fn test_view() {
        let routes = vec![Route::new("tcp:443".parse().unwrap(), ModuleType::ApplicationBalancer, 50)];
        let instances = vec![instance("alb-1", ModuleType::ApplicationBalancer, &["tcp:443"], HealthStatus::Healthy)];
        let view = RoutingSnapshot::build(3, &routes, &instances).view();
        assert_eq!(view.generation, 3);
        assert_eq!(view.entries[0].instances, vec![InstanceId::from("alb-1")]);
    }
}
