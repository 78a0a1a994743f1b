//! Reconciler
//!
//! The control loop that drives the sound server towards the desired graph.
//! One task owns the [`Reconciler`]; passes never overlap. Each pass:
//!
//! 1. observes the server and swaps the snapshot into the store,
//! 2. plans removes, creates and mixer updates ([`plan::compute`]),
//! 3. dispatches removes before creates with bounded concurrency,
//! 4. classifies failures into backoff or blocked routes,
//! 5. re-observes, and recomputes if the desired graph moved meanwhile.
//!
//! Triggers arriving during a pass collapse into a single follow-up pass.

pub mod backoff;
pub mod plan;

pub use backoff::{ActionKey, Backoff, BackoffTable};
pub use plan::{Plan, PlanPolicy, ReconfigureAction, RemoveAction, RemoveReason};

use futures_util::future;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::config::ReconcilerConfig;
use crate::constants::MAX_RECOMPUTES;
use crate::error::GatewayError;
use crate::gateway::ServerGateway;
use crate::protocol::{ModuleHandle, ObservedSnapshot, Route, RouteKey};
use crate::store::{InFlight, RouteMark, TopologyStore};

/// Wake-up signal for the reconciler.
///
/// Any number of fires while a pass runs leave exactly one stored permit,
/// so bursts coalesce into one follow-up pass.
#[derive(Debug, Default)]
pub struct Trigger {
    notify: Notify,
    fired: AtomicU64,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Total number of fires since creation
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// A fresh snapshot was stored
    pub observed: bool,
    pub created: usize,
    pub removed: usize,
    pub reconfigured: usize,
    pub failed: usize,
    /// Plans computed after the first because the desired graph moved
    pub recomputes: u32,
    /// The pass gave up on a moving desired graph; another pass is needed
    pub follow_up: bool,
    /// Why the pass stopped early, if it did
    pub aborted: Option<String>,
}

impl PassReport {
    /// Commands issued against the server, successful or not
    pub fn commands(&self) -> usize {
        self.created + self.removed + self.reconfigured + self.failed
    }
}

#[derive(Debug, Default)]
struct DispatchOutcome {
    created: usize,
    removed: usize,
    reconfigured: usize,
    failed: usize,
    lost_connection: bool,
}

/// Owner of the reconciliation state
pub struct Reconciler {
    gateway: Arc<dyn ServerGateway>,
    store: Arc<TopologyStore>,
    config: ReconcilerConfig,
    backoff: BackoffTable,
    blocked_removes: HashSet<ModuleHandle>,
    adopted: bool,
    /// When the last plan read the backoff table
    planned_at: Instant,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<dyn ServerGateway>,
        store: Arc<TopologyStore>,
        config: ReconcilerConfig,
    ) -> Self {
        let policy = Backoff::new(config.backoff_base(), config.backoff_cap());
        Self {
            gateway,
            store,
            config,
            backoff: BackoffTable::new(policy),
            blocked_removes: HashSet::new(),
            adopted: false,
            planned_at: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<TopologyStore> {
        &self.store
    }

    /// Retry bookkeeping, exposed for inspection
    pub fn backoff(&self) -> &BackoffTable {
        &self.backoff
    }

    /// When the loop should wake for a retry, if any is scheduled.
    ///
    /// Backoffs that expired after the last plan was computed count even if
    /// they are already due, so the returned instant may be in the past.
    pub fn next_retry(&self) -> Option<Instant> {
        self.backoff.next_deadline(self.planned_at)
    }

    /// Run until `shutdown` flips to true or its sender goes away.
    ///
    /// The pass in progress always completes before the loop exits.
    pub async fn run(mut self, trigger: Arc<Trigger>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Reconciler started");

        loop {
            // While disconnected only poller ticks and intents wake the loop.
            let retry_at = if self.store.is_connected() {
                self.next_retry()
            } else {
                None
            };

            tokio::select! {
                _ = trigger.wait() => {}
                _ = sleep_until(retry_at) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            let report = self.run_pass().await;
            if report.follow_up {
                trigger.fire();
            }
        }

        tracing::info!("Reconciler stopped");
    }

    /// Execute one reconciliation pass.
    pub async fn run_pass(&mut self) -> PassReport {
        let mut report = PassReport::default();
        self.planned_at = Instant::now();

        match self.observe().await {
            Ok(true) => report.observed = true,
            Ok(false) => {
                report.aborted = Some("unrecognized listing".to_string());
                return report;
            }
            Err(e) => {
                report.aborted = Some(e.to_string());
                return report;
            }
        }

        self.adopt_existing();

        loop {
            let (desired, version) = self.store.desired();
            let snapshot = self.store.snapshot();
            self.refresh_blocked(&snapshot);

            let blocked = self.store.blocked_routes();
            let now = Instant::now();
            self.planned_at = now;
            let policy = PlanPolicy {
                remove_foreign_orphans: self.config.remove_foreign_orphans,
            };
            let plan = plan::compute(&desired, &snapshot, policy, &blocked, |action| {
                self.backoff.is_ready(action, now)
                    && !matches!(action, ActionKey::Remove(h) if self.blocked_removes.contains(h))
            });

            tracing::debug!(
                version,
                removes = plan.removes.len(),
                creates = plan.creates.len(),
                reconfigures = plan.reconfigures.len(),
                unsatisfiable = plan.unsatisfiable.len(),
                deferred = plan.deferred.len(),
                "Reconciliation plan"
            );

            self.park_unsatisfiable(&plan.unsatisfiable);

            if plan.is_empty() {
                break;
            }

            let outcome = self.dispatch(plan, version).await;
            report.created += outcome.created;
            report.removed += outcome.removed;
            report.reconfigured += outcome.reconfigured;
            report.failed += outcome.failed;

            if outcome.lost_connection {
                report.aborted = Some("sound server unavailable".to_string());
                break;
            }

            match self.observe().await {
                Ok(true) => {}
                Ok(false) => {
                    report.aborted = Some("unrecognized listing".to_string());
                    break;
                }
                Err(e) => {
                    report.aborted = Some(e.to_string());
                    break;
                }
            }

            if self.store.desired_version() == version {
                break;
            }
            report.recomputes += 1;
            if report.recomputes >= MAX_RECOMPUTES {
                tracing::debug!("Desired graph still moving, scheduling another pass");
                report.follow_up = true;
                break;
            }
        }

        self.prune();
        report
    }

    /// List the server and store the result.
    ///
    /// Returns `Ok(false)` when a listing was unrecognizable; the previous
    /// snapshot is kept so a garbled listing never looks like an empty server.
    async fn observe(&mut self) -> Result<bool, GatewayError> {
        let listed = async {
            let endpoints = self.gateway.list_endpoints().await?;
            let modules = self.gateway.list_active_routes().await?;
            Ok::<_, GatewayError>((endpoints, modules))
        }
        .await;

        let (endpoints, modules) = match listed {
            Ok(listed) => listed,
            Err(e) => {
                self.record_observe_failure(&e);
                return Err(e);
            }
        };

        if !endpoints.complete || !modules.complete {
            let errors: Vec<String> = endpoints
                .parse_errors
                .into_iter()
                .chain(modules.parse_errors)
                .collect();
            let error = format!("unrecognized listing: {}", errors.join("; "));
            tracing::warn!("{}, keeping previous snapshot", error);
            if self.store.set_connectivity(true, Some(error)) {
                tracing::info!("Sound server reachable");
            }
            return Ok(false);
        }

        if self.store.set_connectivity(true, None) {
            tracing::info!("Sound server reachable");
        }

        let mut parse_errors = endpoints.parse_errors;
        parse_errors.extend(modules.parse_errors);
        let snapshot = ObservedSnapshot::assemble(endpoints.items, modules.items, parse_errors);
        if !snapshot.stale_routes.is_empty() {
            tracing::debug!(count = snapshot.stale_routes.len(), "Routes with vanished endpoints");
        }
        self.store.replace_snapshot(snapshot);
        Ok(true)
    }

    fn record_observe_failure(&self, error: &GatewayError) {
        if error.is_unavailable() {
            if self.store.set_connectivity(false, Some(error.to_string())) {
                tracing::warn!("Sound server unreachable: {}", error);
            }
        } else {
            let connected = self.store.is_connected();
            self.store.set_connectivity(connected, Some(error.to_string()));
            tracing::warn!("Observation failed: {}", error);
        }
    }

    /// Copy routes loaded before startup into the desired graph, once.
    fn adopt_existing(&mut self) {
        if self.adopted {
            return;
        }
        self.adopted = true;
        if !self.config.adopt_existing {
            return;
        }

        let found: Vec<Route> = self
            .store
            .snapshot()
            .active_routes
            .values()
            .map(|active| active.route.clone())
            .collect();

        // Intents submitted before the first observation take precedence.
        let (adopted, version) = self.store.mutate_desired(|graph| {
            let mut adopted = 0;
            for route in found {
                if !graph.contains(&route.key()) {
                    graph.upsert(route);
                    adopted += 1;
                }
            }
            adopted
        });
        if adopted > 0 {
            tracing::info!(adopted, version, "Adopted existing loopback routes");
        }
    }

    /// Unblock routes whose endpoint went away and came back.
    fn refresh_blocked(&mut self, snapshot: &ObservedSnapshot) {
        let mut unblocked = Vec::new();
        self.store.update_marks(|key, mark| {
            if !mark.blocked {
                return;
            }
            if !snapshot.can_satisfy(key) {
                mark.endpoint_gone = true;
            } else if mark.endpoint_gone {
                mark.blocked = false;
                mark.endpoint_gone = false;
                mark.last_error = None;
                unblocked.push(key.clone());
            }
        });

        for key in unblocked {
            tracing::info!(route = %key, "Endpoint reappeared, retrying route");
            self.backoff.reset(&ActionKey::Create(key));
        }
    }

    /// Routes waiting for an endpoint stop retrying until it reappears.
    fn park_unsatisfiable(&mut self, keys: &[RouteKey]) {
        for key in keys {
            self.backoff.reset(&ActionKey::Create(key.clone()));
            self.store.update_mark(key, |mark| {
                mark.failing = false;
                mark.attempts = 0;
            });
        }
    }

    async fn dispatch(&mut self, plan: Plan, version: u64) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let limit = self.config.max_concurrency.max(1);

        for remove in &plan.removes {
            if tracks_lifecycle(remove.reason) {
                self.store
                    .update_mark(&remove.key, |m| m.in_flight = Some(InFlight::Removing));
            }
        }
        self.store.publish();

        let removes: Vec<(RemoveAction, Result<(), GatewayError>)> =
            self.issue(plan.removes, version, limit, |gateway, action: RemoveAction| async move {
                let result = gateway.remove_route(action.handle).await;
                (action, result)
            })
            .await;

        let mut failed_removes = BTreeSet::new();
        for (action, result) in removes {
            match result {
                Ok(()) => {
                    outcome.removed += 1;
                    self.on_removed(&action);
                }
                Err(e) => {
                    outcome.failed += 1;
                    outcome.lost_connection |= e.is_unavailable();
                    failed_removes.insert(action.key.clone());
                    self.on_remove_failed(&action, e);
                }
            }
        }

        let creates: Vec<Route> = plan
            .creates
            .into_iter()
            .filter(|route| !failed_removes.contains(&route.key()))
            .collect();

        if !outcome.lost_connection && self.store.desired_version() == version {
            for route in &creates {
                self.store
                    .update_mark(&route.key(), |m| m.in_flight = Some(InFlight::Creating));
            }
            self.store.publish();

            let created: Vec<(Route, Result<ModuleHandle, GatewayError>)> =
                self.issue(creates, version, limit, |gateway, route: Route| async move {
                    let result = gateway.create_route(&route).await;
                    (route, result)
                })
                .await;

            for (route, result) in created {
                match result {
                    Ok(handle) => {
                        outcome.created += 1;
                        self.on_created(&route, handle);
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        outcome.lost_connection |= e.is_unavailable();
                        self.on_create_failed(&route, e);
                    }
                }
            }
        }

        if !outcome.lost_connection && self.store.desired_version() == version {
            let reconfigured = self
                .issue(
                    plan.reconfigures,
                    version,
                    limit,
                    |gateway, action: ReconfigureAction| async move {
                        let result = gateway
                            .set_route_config(
                                action.handle,
                                action.config.volume_percent,
                                action.config.muted,
                            )
                            .await;
                        (action, result)
                    },
                )
                .await;

            for (action, result) in reconfigured {
                match result {
                    Ok(()) => {
                        outcome.reconfigured += 1;
                        tracing::debug!(route = %action.key, handle = action.handle, "Route mixer updated");
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        outcome.lost_connection |= e.is_unavailable();
                        tracing::warn!(route = %action.key, handle = action.handle, "Volume/mute not applied: {}", e);
                    }
                }
            }
        }

        if outcome.lost_connection {
            self.store.set_connectivity(false, Some("sound server unavailable".to_string()));
            tracing::warn!("Sound server became unreachable during dispatch");
        }

        // Every issued command has resolved; nothing is in flight any more.
        self.store.update_marks(|_, mark| mark.in_flight = None);
        outcome
    }

    /// Issue commands with at most `limit` in flight.
    ///
    /// No new command starts once the desired graph moves past `version`.
    /// Commands already started always run to completion.
    async fn issue<T, F, Fut, R>(&self, actions: Vec<T>, version: u64, limit: usize, op: F) -> Vec<R>
    where
        F: Fn(Arc<dyn ServerGateway>, T) -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let store = self.store.clone();
        stream::iter(actions)
            .take_while(move |_| future::ready(store.desired_version() == version))
            .map(|action| op(self.gateway.clone(), action))
            .buffer_unordered(limit)
            .collect()
            .await
    }

    fn on_removed(&mut self, action: &RemoveAction) {
        self.backoff.reset(&ActionKey::Remove(action.handle));
        self.blocked_removes.remove(&action.handle);
        tracing::info!(route = %action.key, handle = action.handle, reason = ?action.reason, "Route removed");
        if action.reason == RemoveReason::Orphaned {
            self.store.update_mark(&action.key, RouteMark::record_success);
        }
    }

    fn on_remove_failed(&mut self, action: &RemoveAction, error: GatewayError) {
        let key = ActionKey::Remove(action.handle);

        if matches!(action.reason, RemoveReason::Stale | RemoveReason::Duplicate) {
            // Best effort: the next snapshot decides whether it still exists.
            self.backoff.record_failure(key, Instant::now());
            tracing::debug!(route = %action.key, handle = action.handle, "Cleanup unload failed: {}", error);
            return;
        }

        if error.is_unavailable() {
            self.store.update_mark(&action.key, |m| m.in_flight = None);
        } else if error.is_permanent() {
            tracing::error!(route = %action.key, handle = action.handle, "Route cannot be removed: {}", error);
            self.blocked_removes.insert(action.handle);
            self.backoff.reset(&key);
            self.store.update_mark(&action.key, |m| {
                m.in_flight = None;
                m.last_error = Some(error.to_string());
            });
        } else {
            let (attempts, delay) = self.backoff.record_failure(key, Instant::now());
            tracing::warn!(
                route = %action.key,
                handle = action.handle,
                attempt = attempts,
                retry_in = ?delay,
                "Remove failed: {}", error
            );
            self.store
                .update_mark(&action.key, |m| m.record_transient(attempts, error.to_string()));
        }
    }

    fn on_created(&mut self, route: &Route, handle: ModuleHandle) {
        let key = route.key();
        self.backoff.reset(&ActionKey::Create(key.clone()));
        tracing::info!(route = %key, handle, latency_ms = route.config.latency_ms, "Route created");
        self.store.update_mark(&key, RouteMark::record_success);
    }

    fn on_create_failed(&mut self, route: &Route, error: GatewayError) {
        let key = route.key();
        let action = ActionKey::Create(key.clone());

        if error.is_unavailable() {
            self.store.update_mark(&key, |m| m.in_flight = None);
        } else if error.is_permanent() {
            tracing::error!(route = %key, "Route cannot be created: {}", error);
            self.backoff.reset(&action);
            self.store
                .update_mark(&key, |m| m.record_permanent(error.to_string()));
        } else {
            let (attempts, delay) = self.backoff.record_failure(action, Instant::now());
            tracing::warn!(
                route = %key,
                attempt = attempts,
                retry_in = ?delay,
                "Create failed: {}", error
            );
            self.store
                .update_mark(&key, |m| m.record_transient(attempts, error.to_string()));
        }
    }

    /// Forget retry state and marks for routes that no longer matter.
    fn prune(&mut self) {
        let (desired, _) = self.store.desired();
        let snapshot = self.store.snapshot();

        let loaded: HashSet<ModuleHandle> = snapshot
            .active_routes
            .values()
            .chain(&snapshot.stale_routes)
            .chain(&snapshot.duplicate_routes)
            .map(|active| active.handle)
            .collect();

        self.backoff.retain(|action| match action {
            ActionKey::Create(key) => desired.contains(key),
            ActionKey::Remove(handle) => loaded.contains(handle),
        });
        self.blocked_removes.retain(|handle| loaded.contains(handle));

        // A create reported as failed may still have landed on the server.
        let confirmed: HashSet<&RouteKey> = snapshot
            .active_routes
            .iter()
            .filter(|(key, active)| {
                desired
                    .get(key)
                    .map_or(false, |route| route.config.latency_ms == active.route.config.latency_ms)
            })
            .map(|(key, _)| key)
            .collect();
        for key in &confirmed {
            self.backoff.reset(&ActionKey::Create((*key).clone()));
        }

        self.store.update_marks(|key, mark| {
            if confirmed.contains(key) && mark.in_flight.is_none() {
                mark.record_success();
            } else if !desired.contains(key) && !snapshot.active_routes.contains_key(key) {
                *mark = RouteMark::default();
            }
        });
        self.store.publish();
    }
}

/// Removes that are part of a route's own lifecycle, as opposed to cleanup
/// of extra modules sharing its key.
fn tracks_lifecycle(reason: RemoveReason) -> bool {
    matches!(reason, RemoveReason::Orphaned | RemoveReason::Recreate)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
