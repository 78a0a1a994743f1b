//! Topology store
//!
//! Holds the last observed snapshot, the desired graph with its version, and
//! the reconciler's per-route bookkeeping. Readers never wait on gateway
//! commands: the reconciler only takes a write lock to swap in results.

pub mod marks;

pub use marks::{InFlight, RouteMark};

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

use crate::protocol::{
    DesiredGraph, ObservedSnapshot, RouteKey, RouteState, RouteStatus, TopologyView,
};

#[derive(Debug, Default)]
struct VersionedGraph {
    graph: DesiredGraph,
    version: u64,
}

#[derive(Debug, Default)]
struct Health {
    observed_once: bool,
    connected: bool,
    last_error: Option<String>,
}

/// Shared topology state
pub struct TopologyStore {
    snapshot: RwLock<Arc<ObservedSnapshot>>,
    desired: RwLock<VersionedGraph>,
    marks: RwLock<HashMap<RouteKey, RouteMark>>,
    health: RwLock<Health>,
    view_tx: watch::Sender<Arc<TopologyView>>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    pub fn new() -> Self {
        let snapshot = Arc::new(ObservedSnapshot::empty());
        let (view_tx, _) = watch::channel(Arc::new(TopologyView {
            snapshot: snapshot.clone(),
            desired_version: 0,
            routes: Vec::new(),
            connected: false,
            last_error: None,
        }));

        Self {
            snapshot: RwLock::new(snapshot),
            desired: RwLock::new(VersionedGraph::default()),
            marks: RwLock::new(HashMap::new()),
            health: RwLock::new(Health::default()),
            view_tx,
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ObservedSnapshot> {
        self.snapshot.read().clone()
    }

    /// Swap in a new snapshot atomically and publish.
    pub fn replace_snapshot(&self, snapshot: ObservedSnapshot) -> Arc<ObservedSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = snapshot.clone();
        self.health.write().observed_once = true;
        self.publish();
        snapshot
    }

    /// Whether any observation has succeeded yet
    pub fn has_observed(&self) -> bool {
        self.health.read().observed_once
    }

    /// Desired graph and its version, read together
    pub fn desired(&self) -> (DesiredGraph, u64) {
        let desired = self.desired.read();
        (desired.graph.clone(), desired.version)
    }

    pub fn desired_version(&self) -> u64 {
        self.desired.read().version
    }

    /// Apply `f` to the desired graph under exclusive access.
    ///
    /// The version only advances when the graph actually changed, so
    /// redundant edits never invalidate an in-flight plan.
    pub fn mutate_desired<R>(&self, f: impl FnOnce(&mut DesiredGraph) -> R) -> (R, u64) {
        let (result, version, changed) = {
            let mut desired = self.desired.write();
            let before = desired.graph.clone();
            let result = f(&mut desired.graph);
            let changed = desired.graph != before;
            if changed {
                desired.version += 1;
            }
            (result, desired.version, changed)
        };

        if changed {
            self.publish();
        }
        (result, version)
    }

    pub fn mark(&self, key: &RouteKey) -> Option<RouteMark> {
        self.marks.read().get(key).cloned()
    }

    /// Update the bookkeeping of one route. Empty marks are dropped.
    pub fn update_mark(&self, key: &RouteKey, f: impl FnOnce(&mut RouteMark)) {
        let mut marks = self.marks.write();
        let mark = marks.entry(key.clone()).or_default();
        f(mark);
        if mark.is_clear() {
            marks.remove(key);
        }
    }

    /// Update every mark at once
    pub fn update_marks(&self, mut f: impl FnMut(&RouteKey, &mut RouteMark)) {
        let mut marks = self.marks.write();
        for (key, mark) in marks.iter_mut() {
            f(key, mark);
        }
        marks.retain(|_, mark| !mark.is_clear());
    }

    pub fn clear_mark(&self, key: &RouteKey) {
        self.marks.write().remove(key);
    }

    /// Routes blocked by a permanent failure
    pub fn blocked_routes(&self) -> BTreeSet<RouteKey> {
        self.marks
            .read()
            .iter()
            .filter(|(_, mark)| mark.blocked)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.health.read().connected
    }

    /// Record connectivity. Returns true when it flipped.
    pub fn set_connectivity(&self, connected: bool, error: Option<String>) -> bool {
        let flipped = {
            let mut health = self.health.write();
            let flipped = health.connected != connected;
            health.connected = connected;
            health.last_error = error;
            flipped
        };
        self.publish();
        flipped
    }

    /// Derived status of every route that is desired, observed or in flight.
    pub fn route_statuses(&self) -> Vec<RouteStatus> {
        let snapshot = self.snapshot();
        let desired = self.desired.read();
        let marks = self.marks.read();
        let observed_once = self.health.read().observed_once;

        let mut keys: BTreeSet<&RouteKey> = desired.graph.keys().collect();
        keys.extend(snapshot.active_routes.keys());
        keys.extend(marks.iter().filter(|(_, m)| m.in_flight.is_some()).map(|(k, _)| k));

        keys.into_iter()
            .map(|key| {
                let wanted = desired.graph.get(key);
                let observed = snapshot.active_routes.get(key);
                let mark = marks.get(key);

                let state = derive_state(wanted.is_some(), observed.is_some(), mark);
                let missing_endpoint = observed_once && !snapshot.can_satisfy(key);

                RouteStatus {
                    key: key.clone(),
                    state,
                    desired: wanted.map(|r| r.config),
                    observed: observed.map(|a| a.route.config),
                    handle: observed.map(|a| a.handle),
                    unsatisfiable: wanted.is_some()
                        && (missing_endpoint || mark.map_or(false, |m| m.blocked)),
                    attempts: mark.map_or(0, |m| m.attempts),
                    last_error: mark.and_then(|m| m.last_error.clone()),
                }
            })
            .collect()
    }

    /// Build the presentation view from current state
    pub fn view(&self) -> TopologyView {
        let routes = self.route_statuses();
        let health = self.health.read();
        TopologyView {
            snapshot: self.snapshot(),
            desired_version: self.desired_version(),
            routes,
            connected: health.connected,
            last_error: health.last_error.clone(),
        }
    }

    /// Push the current view to subscribers
    pub fn publish(&self) {
        self.view_tx.send_replace(Arc::new(self.view()));
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologyView>> {
        self.view_tx.subscribe()
    }

    /// Last published view
    pub fn latest_view(&self) -> Arc<TopologyView> {
        self.view_tx.borrow().clone()
    }
}

fn derive_state(desired: bool, observed: bool, mark: Option<&RouteMark>) -> RouteState {
    match mark.and_then(|m| m.in_flight) {
        Some(InFlight::Creating) => return RouteState::Pending,
        Some(InFlight::Removing) => return RouteState::Removing,
        None => {}
    }
    let failing = mark.map_or(false, |m| m.failing);
    match (desired, observed) {
        // Only reachable for a mark that outlived its route; show it as going away.
        (false, false) => RouteState::Removing,
        // A create, reload or unload is waiting out its backoff.
        _ if failing => RouteState::Failing,
        (true, true) => RouteState::Active,
        (true, false) => RouteState::DesiredOnly,
        (false, true) => RouteState::Orphaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActiveRoute, Direction, Endpoint, Route, RouteConfig};

    fn endpoint(id: &str, direction: Direction) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            index: 1,
            name: id.to_string(),
            direction,
            live: true,
        }
    }

    fn snapshot_with(routes: &[(&str, &str, u32)]) -> ObservedSnapshot {
        ObservedSnapshot::assemble(
            vec![
                endpoint("mic1", Direction::Source),
                endpoint("spk1", Direction::Sink),
                endpoint("spk2", Direction::Sink),
            ],
            routes
                .iter()
                .map(|(source, sink, handle)| ActiveRoute {
                    route: Route::new(*source, *sink, RouteConfig::default()),
                    handle: *handle,
                    owned: true,
                })
                .collect(),
            Vec::new(),
        )
    }

    #[test]
    fn test_version_advances_only_on_change() {
        let store = TopologyStore::new();
        let route = Route::new("mic1", "spk1", RouteConfig::default());

        let (changed, v1) = store.mutate_desired(|g| g.upsert(route.clone()));
        assert!(changed);
        assert_eq!(v1, 1);

        let (changed, v2) = store.mutate_desired(|g| g.upsert(route.clone()));
        assert!(!changed);
        assert_eq!(v2, 1);

        let (_, v3) = store.mutate_desired(|g| g.remove(&route.key()));
        assert_eq!(v3, 2);
    }

    #[test]
    fn test_replace_snapshot_is_visible_to_readers() {
        let store = TopologyStore::new();
        let before = store.snapshot();
        store.replace_snapshot(snapshot_with(&[("mic1", "spk1", 42)]));

        assert!(before.active_routes.is_empty());
        assert_eq!(store.snapshot().active_routes.len(), 1);
        assert!(store.has_observed());
    }

    #[test]
    fn test_route_states() {
        let store = TopologyStore::new();
        store.replace_snapshot(snapshot_with(&[("mic1", "spk1", 42), ("mic1", "spk2", 43)]));
        store.mutate_desired(|g| {
            g.upsert(Route::new("mic1", "spk1", RouteConfig::default()));
            g.upsert(Route::new("mic1", "gone", RouteConfig::default()));
        });

        let statuses = store.route_statuses();
        let state_of = |sink: &str| {
            statuses
                .iter()
                .find(|s| s.key.sink == sink)
                .map(|s| (s.state, s.unsatisfiable))
        };

        assert_eq!(state_of("spk1"), Some((RouteState::Active, false)));
        assert_eq!(state_of("spk2"), Some((RouteState::Orphaned, false)));
        assert_eq!(state_of("gone"), Some((RouteState::DesiredOnly, true)));
    }

    #[test]
    fn test_marks_drive_pending_and_failing() {
        let store = TopologyStore::new();
        store.replace_snapshot(snapshot_with(&[]));
        let key = RouteKey::new("mic1", "spk1");
        store.mutate_desired(|g| g.upsert(Route::new("mic1", "spk1", RouteConfig::default())));

        store.update_mark(&key, |m| m.in_flight = Some(InFlight::Creating));
        assert_eq!(store.route_statuses()[0].state, RouteState::Pending);

        store.update_mark(&key, |m| {
            m.in_flight = None;
            m.failing = true;
            m.attempts = 2;
        });
        let status = &store.route_statuses()[0];
        assert_eq!(status.state, RouteState::Failing);
        assert_eq!(status.attempts, 2);

        store.update_mark(&key, |m| *m = RouteMark::default());
        assert!(store.mark(&key).is_none());
    }

    #[test]
    fn test_failing_unload_of_orphan_is_visible() {
        let store = TopologyStore::new();
        store.replace_snapshot(snapshot_with(&[("mic1", "spk2", 43)]));
        let key = RouteKey::new("mic1", "spk2");
        assert_eq!(store.route_statuses()[0].state, RouteState::Orphaned);

        store.update_mark(&key, |m| m.record_transient(1, "timed out".into()));
        let status = &store.route_statuses()[0];
        assert_eq!(status.state, RouteState::Failing);
        assert_eq!(status.last_error.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_view_serializes_with_shared_snapshot() {
        let store = TopologyStore::new();
        store.replace_snapshot(snapshot_with(&[("mic1", "spk1", 42)]));

        let json = serde_json::to_value(store.view()).unwrap();
        assert_eq!(json["connected"], false);
        assert_eq!(json["routes"][0]["handle"], 42);
        assert!(json["snapshot"]["endpoints"].is_array());
        assert_eq!(json["snapshot"]["active_routes"][0]["handle"], 42);
    }

    #[test]
    fn test_subscribers_see_published_views() {
        let store = TopologyStore::new();
        let mut rx = store.subscribe();
        store.mutate_desired(|g| g.upsert(Route::new("mic1", "spk1", RouteConfig::default())));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().desired_version, 1);
    }
}
