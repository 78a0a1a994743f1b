//! Routing data model shared by the gateway, store, reconciler and UI
//!
//! Everything here is plain data: endpoints and routes as the sound server
//! reports them, the desired graph the user edits, and the derived per-route
//! status the presentation layer renders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::constants::{DEFAULT_LATENCY_MS, DEFAULT_VOLUME_PERCENT, MAX_VOLUME_PERCENT};
use crate::error::IntentError;

/// Server-assigned index of a loaded loopback module
pub type ModuleHandle = u32;

/// Whether an endpoint produces or consumes audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Source,
    Sink,
}

/// A source or sink known to the sound server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Server name of the endpoint, stable across re-plugging
    pub id: String,
    /// Server index, reassigned whenever the endpoint is recreated
    pub index: u32,
    /// Human-readable description
    pub name: String,
    pub direction: Direction,
    pub live: bool,
}

/// Identity of a route: one source feeding one sink
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub source: String,
    pub sink: String,
}

impl RouteKey {
    pub fn new(source: impl Into<String>, sink: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sink: sink.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.sink)
    }
}

/// Per-route loopback settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub latency_ms: u32,
    /// 0-150, values above 100 boost
    pub volume_percent: u16,
    pub muted: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            latency_ms: DEFAULT_LATENCY_MS,
            volume_percent: DEFAULT_VOLUME_PERCENT,
            muted: false,
        }
    }
}

impl RouteConfig {
    pub fn with_latency(latency_ms: u32) -> Self {
        Self {
            latency_ms,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), IntentError> {
        if self.volume_percent > MAX_VOLUME_PERCENT {
            return Err(IntentError::InvalidConfig(format!(
                "volume {}% exceeds {}%",
                self.volume_percent, MAX_VOLUME_PERCENT
            )));
        }
        Ok(())
    }

    /// Volume and mute are adjustable in place; latency needs a new module.
    pub fn mixer_differs(&self, other: &RouteConfig) -> bool {
        self.volume_percent != other.volume_percent || self.muted != other.muted
    }
}

/// A desired or observed connection between a source and a sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub source: String,
    pub sink: String,
    #[serde(default)]
    pub config: RouteConfig,
}

impl Route {
    pub fn new(source: impl Into<String>, sink: impl Into<String>, config: RouteConfig) -> Self {
        Self {
            source: source.into(),
            sink: sink.into(),
            config,
        }
    }

    pub fn key(&self) -> RouteKey {
        RouteKey::new(self.source.clone(), self.sink.clone())
    }
}

/// A route realized by a loaded loopback module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRoute {
    pub route: Route,
    pub handle: ModuleHandle,
    /// Carries this engine's owner tag in its module arguments
    pub owned: bool,
}

impl ActiveRoute {
    pub fn key(&self) -> RouteKey {
        self.route.key()
    }
}

/// Everything the sound server reported in one observation cycle.
///
/// Snapshots are immutable once assembled; the store swaps whole snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ObservedSnapshot {
    pub taken_at: DateTime<Utc>,
    pub endpoints: Vec<Endpoint>,
    #[serde(serialize_with = "map_values")]
    pub active_routes: BTreeMap<RouteKey, ActiveRoute>,
    /// Modules whose source or sink is no longer present
    pub stale_routes: Vec<ActiveRoute>,
    /// Extra modules for a pair that already has an active route
    pub duplicate_routes: Vec<ActiveRoute>,
    /// Records that could not be parsed, skipped
    pub parse_errors: Vec<String>,
}

impl Default for ObservedSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl ObservedSnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            endpoints: Vec::new(),
            active_routes: BTreeMap::new(),
            stale_routes: Vec::new(),
            duplicate_routes: Vec::new(),
            parse_errors: Vec::new(),
        }
    }

    /// Build a snapshot from raw gateway listings.
    ///
    /// `modules` carry the endpoint references exactly as the server printed
    /// them (name or numeric index); they are normalized to endpoint ids here.
    pub fn assemble(
        endpoints: Vec<Endpoint>,
        modules: Vec<ActiveRoute>,
        parse_errors: Vec<String>,
    ) -> Self {
        let mut snapshot = Self {
            taken_at: Utc::now(),
            endpoints,
            active_routes: BTreeMap::new(),
            stale_routes: Vec::new(),
            duplicate_routes: Vec::new(),
            parse_errors,
        };

        let mut modules = modules;
        // Owned modules first, then oldest handle, so the survivor of a
        // duplicate pair is deterministic.
        modules.sort_by_key(|m| (!m.owned, m.handle));

        for mut module in modules {
            let source = snapshot.resolve(&module.route.source, Direction::Source);
            let sink = snapshot.resolve(&module.route.sink, Direction::Sink);
            match (source, sink) {
                (Some(source), Some(sink)) => {
                    module.route.source = source;
                    module.route.sink = sink;
                    let key = module.key();
                    if snapshot.active_routes.contains_key(&key) {
                        snapshot.duplicate_routes.push(module);
                    } else {
                        snapshot.active_routes.insert(key, module);
                    }
                }
                _ => snapshot.stale_routes.push(module),
            }
        }

        snapshot
    }

    /// Map a server reference (name or index) to an endpoint id.
    ///
    /// An exact name wins over an endpoint whose index happens to match.
    pub fn resolve(&self, reference: &str, direction: Direction) -> Option<String> {
        if let Some(named) = self.endpoint(reference, direction) {
            return Some(named.id.clone());
        }
        let index = reference.parse::<u32>().ok()?;
        self.endpoints
            .iter()
            .find(|e| e.direction == direction && e.index == index)
            .map(|e| e.id.clone())
    }

    pub fn endpoint(&self, id: &str, direction: Direction) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.direction == direction && e.id == id)
    }

    pub fn has_endpoint(&self, id: &str, direction: Direction) -> bool {
        self.endpoint(id, direction).is_some()
    }

    /// Both ends of the route are present in this snapshot.
    pub fn can_satisfy(&self, key: &RouteKey) -> bool {
        self.has_endpoint(&key.source, Direction::Source)
            && self.has_endpoint(&key.sink, Direction::Sink)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.direction == Direction::Source)
    }

    pub fn sinks(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.direction == Direction::Sink)
    }
}

/// JSON object keys must be strings; maps keyed by route serialize as lists.
fn map_values<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    V: Serialize,
{
    serializer.collect_seq(map.values())
}

/// The set of routes the user wants active
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DesiredGraph {
    #[serde(serialize_with = "map_values")]
    routes: BTreeMap<RouteKey, Route>,
}

impl DesiredGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RouteKey) -> Option<&Route> {
        self.routes.get(key)
    }

    pub fn contains(&self, key: &RouteKey) -> bool {
        self.routes.contains_key(key)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RouteKey> {
        self.routes.keys()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Insert or replace. Returns whether the graph changed.
    pub fn upsert(&mut self, route: Route) -> bool {
        let key = route.key();
        match self.routes.get(&key) {
            Some(existing) if *existing == route => false,
            _ => {
                self.routes.insert(key, route);
                true
            }
        }
    }

    /// Remove if present. Returns whether the graph changed.
    pub fn remove(&mut self, key: &RouteKey) -> bool {
        self.routes.remove(key).is_some()
    }

    /// Remove every route fed by `source`. Returns the number removed.
    pub fn remove_from_source(&mut self, source: &str) -> usize {
        let before = self.routes.len();
        self.routes.retain(|key, _| key.source != source);
        before - self.routes.len()
    }

    /// Replace the config of an existing route. Returns whether it changed.
    pub fn set_config(&mut self, key: &RouteKey, config: RouteConfig) -> bool {
        match self.routes.get_mut(key) {
            Some(route) if route.config != config => {
                route.config = config;
                true
            }
            _ => false,
        }
    }
}

/// Derived lifecycle state of a single route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    /// Desired, nothing issued yet
    DesiredOnly,
    /// Create issued, not yet confirmed
    Pending,
    /// Confirmed by the last snapshot
    Active,
    /// Last command errored, waiting for backoff
    Failing,
    /// Unload issued
    Removing,
    /// Loaded on the server but not desired
    Orphaned,
}

/// Presentation-facing status of one route
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStatus {
    pub key: RouteKey,
    pub state: RouteState,
    pub desired: Option<RouteConfig>,
    pub observed: Option<RouteConfig>,
    pub handle: Option<ModuleHandle>,
    pub unsatisfiable: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Published to subscribers after every store change
#[derive(Debug, Clone, Serialize)]
pub struct TopologyView {
    pub snapshot: Arc<ObservedSnapshot>,
    pub desired_version: u64,
    pub routes: Vec<RouteStatus>,
    pub connected: bool,
    pub last_error: Option<String>,
}

impl TopologyView {
    pub fn route(&self, key: &RouteKey) -> Option<&RouteStatus> {
        self.routes.iter().find(|r| &r.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str, index: u32, direction: Direction) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            index,
            name: id.to_string(),
            direction,
            live: true,
        }
    }

    fn module(handle: u32, source: &str, sink: &str, owned: bool) -> ActiveRoute {
        ActiveRoute {
            route: Route::new(source, sink, RouteConfig::default()),
            handle,
            owned,
        }
    }

    #[test]
    fn test_assemble_resolves_indices_to_names() {
        let snapshot = ObservedSnapshot::assemble(
            vec![
                endpoint("mic1", 3, Direction::Source),
                endpoint("spk1", 7, Direction::Sink),
            ],
            vec![module(42, "3", "spk1", true)],
            Vec::new(),
        );

        let key = RouteKey::new("mic1", "spk1");
        assert_eq!(snapshot.active_routes.get(&key).map(|r| r.handle), Some(42));
        assert!(snapshot.stale_routes.is_empty());
    }

    #[test]
    fn test_assemble_purges_stale_routes() {
        let snapshot = ObservedSnapshot::assemble(
            vec![endpoint("mic1", 3, Direction::Source)],
            vec![module(42, "mic1", "spk-gone", true)],
            Vec::new(),
        );

        assert!(snapshot.active_routes.is_empty());
        assert_eq!(snapshot.stale_routes.len(), 1);
    }

    #[test]
    fn test_assemble_keeps_one_route_per_pair() {
        let snapshot = ObservedSnapshot::assemble(
            vec![
                endpoint("mic1", 3, Direction::Source),
                endpoint("spk1", 7, Direction::Sink),
            ],
            vec![
                module(50, "mic1", "spk1", false),
                module(44, "mic1", "spk1", true),
                module(43, "3", "7", false),
            ],
            Vec::new(),
        );

        assert_eq!(snapshot.active_routes.len(), 1);
        let kept = snapshot.active_routes.values().next().unwrap();
        assert_eq!(kept.handle, 44);
        assert_eq!(snapshot.duplicate_routes.len(), 2);
    }

    #[test]
    fn test_resolve_respects_direction() {
        let snapshot = ObservedSnapshot::assemble(
            vec![
                endpoint("dev", 1, Direction::Source),
                endpoint("out", 1, Direction::Sink),
            ],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(snapshot.resolve("1", Direction::Sink).as_deref(), Some("out"));
        assert_eq!(snapshot.resolve("1", Direction::Source).as_deref(), Some("dev"));
        assert_eq!(snapshot.resolve("out", Direction::Source), None);
    }

    #[test]
    fn test_resolve_prefers_name_over_index() {
        let snapshot = ObservedSnapshot::assemble(
            vec![
                endpoint("hdmi", 7, Direction::Sink),
                endpoint("7", 3, Direction::Sink),
            ],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(snapshot.resolve("7", Direction::Sink).as_deref(), Some("7"));
        assert_eq!(snapshot.resolve("3", Direction::Sink).as_deref(), Some("7"));
    }

    #[test]
    fn test_desired_graph_edits_are_total() {
        let mut graph = DesiredGraph::new();
        let route = Route::new("mic1", "spk1", RouteConfig::with_latency(50));

        assert!(graph.upsert(route.clone()));
        assert!(!graph.upsert(route.clone()));
        assert!(!graph.set_config(&RouteKey::new("x", "y"), RouteConfig::default()));
        assert!(graph.remove(&route.key()));
        assert!(!graph.remove(&route.key()));
        assert_eq!(graph.remove_from_source("mic1"), 0);
    }

    #[test]
    fn test_volume_limit() {
        let mut config = RouteConfig::default();
        config.volume_percent = 150;
        assert!(config.validate().is_ok());
        config.volume_percent = 151;
        assert!(config.validate().is_err());
    }
}
