//! Desired vs observed diff
//!
//! Pure function of a snapshot and a desired graph. The reconciler decides
//! what to do with the result; nothing here touches the gateway.

use std::collections::BTreeSet;

use super::backoff::ActionKey;
use crate::protocol::{
    DesiredGraph, ModuleHandle, ObservedSnapshot, Route, RouteConfig, RouteKey,
};

/// Knobs that change what counts as removable
#[derive(Debug, Clone, Copy)]
pub struct PlanPolicy {
    /// Orphans without our owner tag are removed too
    pub remove_foreign_orphans: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// Loaded but not desired
    Orphaned,
    /// An endpoint is gone
    Stale,
    /// Another module already serves the pair
    Duplicate,
    /// Desired latency changed; the module is reloaded
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveAction {
    pub key: RouteKey,
    pub handle: ModuleHandle,
    pub reason: RemoveReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigureAction {
    pub key: RouteKey,
    pub handle: ModuleHandle,
    pub config: RouteConfig,
}

/// Actions for one reconciliation step
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub removes: Vec<RemoveAction>,
    pub creates: Vec<Route>,
    pub reconfigures: Vec<ReconfigureAction>,
    /// Desired routes with an endpoint missing from the snapshot
    pub unsatisfiable: Vec<RouteKey>,
    /// Desired routes held back by a permanent failure
    pub blocked: Vec<RouteKey>,
    /// Actions waiting for their backoff to expire
    pub deferred: Vec<ActionKey>,
}

impl Plan {
    /// No command to issue
    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.creates.is_empty() && self.reconfigures.is_empty()
    }

    pub fn command_count(&self) -> usize {
        self.removes.len() + self.creates.len() + self.reconfigures.len()
    }
}

/// Compute the actions that move `snapshot` towards `desired`.
///
/// `ready` filters create/remove actions still in backoff; those are listed
/// in `deferred` instead.
pub fn compute(
    desired: &DesiredGraph,
    snapshot: &ObservedSnapshot,
    policy: PlanPolicy,
    blocked: &BTreeSet<RouteKey>,
    ready: impl Fn(&ActionKey) -> bool,
) -> Plan {
    let mut plan = Plan::default();
    let removable = |owned: bool| owned || policy.remove_foreign_orphans;

    let push_remove = |plan: &mut Plan, key: RouteKey, handle: ModuleHandle, reason| {
        let action = ActionKey::Remove(handle);
        if ready(&action) {
            plan.removes.push(RemoveAction { key, handle, reason });
        } else {
            plan.deferred.push(action);
        }
    };

    let mut recreate = Vec::new();
    for (key, active) in &snapshot.active_routes {
        match desired.get(key) {
            None => {
                if removable(active.owned) {
                    push_remove(&mut plan, key.clone(), active.handle, RemoveReason::Orphaned);
                }
            }
            Some(route) if route.config.latency_ms != active.route.config.latency_ms => {
                if blocked.contains(key) {
                    continue;
                }
                // Both halves must be ready, or the new module would join the old one.
                let create = ActionKey::Create(key.clone());
                let remove = ActionKey::Remove(active.handle);
                if !ready(&create) {
                    plan.deferred.push(create);
                } else if !ready(&remove) {
                    plan.deferred.push(remove);
                } else {
                    plan.removes.push(RemoveAction {
                        key: key.clone(),
                        handle: active.handle,
                        reason: RemoveReason::Recreate,
                    });
                    recreate.push(key.clone());
                }
            }
            Some(route) if route.config.mixer_differs(&active.route.config) => {
                plan.reconfigures.push(ReconfigureAction {
                    key: key.clone(),
                    handle: active.handle,
                    config: route.config,
                });
            }
            Some(_) => {}
        }
    }

    for stale in &snapshot.stale_routes {
        if removable(stale.owned) {
            push_remove(&mut plan, stale.key(), stale.handle, RemoveReason::Stale);
        }
    }

    for duplicate in &snapshot.duplicate_routes {
        if removable(duplicate.owned) {
            push_remove(&mut plan, duplicate.key(), duplicate.handle, RemoveReason::Duplicate);
        }
    }

    for route in desired.routes() {
        let key = route.key();
        let recreating = recreate.contains(&key);
        if snapshot.active_routes.contains_key(&key) && !recreating {
            continue;
        }
        if !snapshot.can_satisfy(&key) {
            plan.unsatisfiable.push(key);
            continue;
        }
        if blocked.contains(&key) {
            plan.blocked.push(key);
            continue;
        }
        let action = ActionKey::Create(key);
        if recreating || ready(&action) {
            plan.creates.push(route.clone());
        } else {
            plan.deferred.push(action);
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActiveRoute, Direction, Endpoint};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    const SOURCES: [&str; 3] = ["mic1", "mic2", "line"];
    const SINKS: [&str; 3] = ["spk1", "spk2", "hdmi"];

    fn endpoints() -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        for (i, id) in SOURCES.iter().enumerate() {
            endpoints.push(Endpoint {
                id: id.to_string(),
                index: i as u32,
                name: id.to_string(),
                direction: Direction::Source,
                live: true,
            });
        }
        for (i, id) in SINKS.iter().enumerate() {
            endpoints.push(Endpoint {
                id: id.to_string(),
                index: 10 + i as u32,
                name: id.to_string(),
                direction: Direction::Sink,
                live: true,
            });
        }
        endpoints
    }

    fn active(handle: u32, source: &str, sink: &str, config: RouteConfig) -> ActiveRoute {
        ActiveRoute {
            route: Route::new(source, sink, config),
            handle,
            owned: true,
        }
    }

    fn policy() -> PlanPolicy {
        PlanPolicy {
            remove_foreign_orphans: true,
        }
    }

    fn plan_for(desired: &DesiredGraph, snapshot: &ObservedSnapshot) -> Plan {
        compute(desired, snapshot, policy(), &BTreeSet::new(), |_| true)
    }

    #[test]
    fn test_creates_missing_route() {
        let mut desired = DesiredGraph::new();
        desired.upsert(Route::new("mic1", "spk1", RouteConfig::with_latency(50)));
        let snapshot = ObservedSnapshot::assemble(endpoints(), Vec::new(), Vec::new());

        let plan = plan_for(&desired, &snapshot);
        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.creates[0].config.latency_ms, 50);
        assert!(plan.removes.is_empty());
    }

    #[test]
    fn test_removes_orphan_and_respects_foreign_policy() {
        let mut foreign = active(7, "mic2", "spk2", RouteConfig::default());
        foreign.owned = false;
        let snapshot = ObservedSnapshot::assemble(
            endpoints(),
            vec![active(5, "mic1", "spk1", RouteConfig::default()), foreign],
            Vec::new(),
        );
        let desired = DesiredGraph::new();

        let plan = plan_for(&desired, &snapshot);
        assert_eq!(plan.removes.len(), 2);
        assert!(plan.removes.iter().all(|r| r.reason == RemoveReason::Orphaned));

        let keep_foreign = PlanPolicy {
            remove_foreign_orphans: false,
        };
        let plan = compute(&desired, &snapshot, keep_foreign, &BTreeSet::new(), |_| true);
        assert_eq!(plan.removes.len(), 1);
        assert_eq!(plan.removes[0].handle, 5);
    }

    #[test]
    fn test_latency_change_recreates() {
        let mut desired = DesiredGraph::new();
        desired.upsert(Route::new("mic1", "spk1", RouteConfig::with_latency(80)));
        let snapshot = ObservedSnapshot::assemble(
            endpoints(),
            vec![active(5, "mic1", "spk1", RouteConfig::with_latency(20))],
            Vec::new(),
        );

        let plan = plan_for(&desired, &snapshot);
        assert_eq!(plan.removes.len(), 1);
        assert_eq!(plan.removes[0].reason, RemoveReason::Recreate);
        assert_eq!(plan.creates.len(), 1);
    }

    #[test]
    fn test_mixer_change_reconfigures() {
        let mut config = RouteConfig::default();
        config.volume_percent = 120;
        let mut desired = DesiredGraph::new();
        desired.upsert(Route::new("mic1", "spk1", config));
        let snapshot = ObservedSnapshot::assemble(
            endpoints(),
            vec![active(5, "mic1", "spk1", RouteConfig::default())],
            Vec::new(),
        );

        let plan = plan_for(&desired, &snapshot);
        assert!(plan.removes.is_empty() && plan.creates.is_empty());
        assert_eq!(plan.reconfigures.len(), 1);
        assert_eq!(plan.reconfigures[0].config.volume_percent, 120);
    }

    #[test]
    fn test_missing_endpoint_is_unsatisfiable() {
        let mut desired = DesiredGraph::new();
        desired.upsert(Route::new("mic1", "usb-headset", RouteConfig::default()));
        let snapshot = ObservedSnapshot::assemble(endpoints(), Vec::new(), Vec::new());

        let plan = plan_for(&desired, &snapshot);
        assert!(plan.is_empty());
        assert_eq!(plan.unsatisfiable, vec![RouteKey::new("mic1", "usb-headset")]);
    }

    #[test]
    fn test_stale_and_duplicate_removed() {
        let snapshot = ObservedSnapshot::assemble(
            endpoints(),
            vec![
                active(5, "mic1", "spk1", RouteConfig::default()),
                active(6, "mic1", "spk1", RouteConfig::default()),
                active(9, "gone", "spk1", RouteConfig::default()),
            ],
            Vec::new(),
        );
        let mut desired = DesiredGraph::new();
        desired.upsert(Route::new("mic1", "spk1", RouteConfig::default()));

        let plan = plan_for(&desired, &snapshot);
        let mut reasons: Vec<_> = plan.removes.iter().map(|r| (r.handle, r.reason)).collect();
        reasons.sort_by_key(|(h, _)| *h);
        assert_eq!(
            reasons,
            vec![(6, RemoveReason::Duplicate), (9, RemoveReason::Stale)]
        );
        assert!(plan.creates.is_empty());
    }

    #[test]
    fn test_backoff_and_block_hold_creates() {
        let mut desired = DesiredGraph::new();
        desired.upsert(Route::new("mic1", "spk1", RouteConfig::default()));
        desired.upsert(Route::new("mic2", "spk2", RouteConfig::default()));
        let snapshot = ObservedSnapshot::assemble(endpoints(), Vec::new(), Vec::new());

        let blocked: BTreeSet<_> = [RouteKey::new("mic2", "spk2")].into_iter().collect();
        let plan = compute(&desired, &snapshot, policy(), &blocked, |_| false);

        assert!(plan.creates.is_empty());
        assert_eq!(plan.blocked, vec![RouteKey::new("mic2", "spk2")]);
        assert_eq!(
            plan.deferred,
            vec![ActionKey::Create(RouteKey::new("mic1", "spk1"))]
        );
    }

    /// Apply a plan the way an always-successful server would.
    fn apply(plan: &Plan, modules: &mut BTreeMap<u32, Route>, next: &mut u32) {
        for remove in &plan.removes {
            modules.remove(&remove.handle);
        }
        for route in &plan.creates {
            if !modules.values().any(|r| r.key() == route.key()) {
                modules.insert(*next, route.clone());
                *next += 1;
            }
        }
        for reconfigure in &plan.reconfigures {
            if let Some(route) = modules.get_mut(&reconfigure.handle) {
                route.config = reconfigure.config;
            }
        }
    }

    fn observe(modules: &BTreeMap<u32, Route>) -> ObservedSnapshot {
        let routes = modules
            .iter()
            .map(|(handle, route)| ActiveRoute {
                route: route.clone(),
                handle: *handle,
                owned: true,
            })
            .collect();
        ObservedSnapshot::assemble(endpoints(), routes, Vec::new())
    }

    fn route_strategy() -> impl Strategy<Value = Route> {
        (0..3usize, 0..4usize, prop::sample::select(vec![20u32, 50]), 0..=150u16, any::<bool>())
            .prop_map(|(source, sink, latency_ms, volume_percent, muted)| {
                // Sink index 3 does not exist, exercising unsatisfiable routes
                let sink = SINKS.get(sink).copied().unwrap_or("missing");
                Route::new(
                    SOURCES[source],
                    sink,
                    RouteConfig {
                        latency_ms,
                        volume_percent,
                        muted,
                    },
                )
            })
    }

    proptest! {
        #[test]
        fn prop_plan_never_creates_twice_for_a_pair(
            wanted in prop::collection::vec(route_strategy(), 0..8),
            existing in prop::collection::vec(route_strategy(), 0..8),
        ) {
            let mut desired = DesiredGraph::new();
            for route in wanted {
                desired.upsert(route);
            }
            let mut modules: BTreeMap<u32, Route> = existing.into_iter().enumerate()
                .map(|(i, r)| (i as u32 + 1, r))
                .collect();

            let plan = plan_for(&desired, &observe(&modules));
            let keys: BTreeSet<_> = plan.creates.iter().map(Route::key).collect();
            prop_assert_eq!(keys.len(), plan.creates.len());

            // One application converges; a second plan has nothing to do.
            let mut next = 100;
            apply(&plan, &mut modules, &mut next);
            let snapshot = observe(&modules);
            let again = plan_for(&desired, &snapshot);
            prop_assert!(again.is_empty(), "second plan not empty: {:?}", again);

            let satisfiable: BTreeSet<_> = desired.keys()
                .filter(|k| snapshot.can_satisfy(k))
                .cloned()
                .collect();
            let active: BTreeSet<_> = snapshot.active_routes.keys().cloned().collect();
            prop_assert_eq!(active, satisfiable);
        }
    }
}
