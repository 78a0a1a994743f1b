//! Intent Queue
//!
//! Desired-state edits from the presentation layer. Each edit is applied to
//! the desired graph right away and then wakes the reconciler; the caller
//! never waits for server commands. Edits are total: removing an absent
//! route or re-adding an identical one is accepted and changes nothing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::IntentError;
use crate::protocol::{Direction, Route, RouteConfig, RouteKey};
use crate::reconciler::Trigger;
use crate::store::TopologyStore;

/// A desired-state edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    /// Ensure the route exists with this config
    AddRoute(Route),
    /// Ensure the route is absent
    RemoveRoute(RouteKey),
    /// Change the config of a desired route
    SetConfig { key: RouteKey, config: RouteConfig },
    /// Remove every route fed by `source`
    RemoveAllFrom { source: String },
}

/// Result of a submitted intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentOutcome {
    /// Desired graph version after the edit
    pub version: u64,
    /// The edit changed the desired graph
    pub changed: bool,
    /// Accepted, but worth telling the user about
    pub warning: Option<IntentError>,
}

/// Entry point for desired-state edits
#[derive(Clone)]
pub struct IntentQueue {
    store: Arc<TopologyStore>,
    trigger: Arc<Trigger>,
}

impl IntentQueue {
    pub fn new(store: Arc<TopologyStore>, trigger: Arc<Trigger>) -> Self {
        Self { store, trigger }
    }

    /// Apply an intent and signal the reconciler.
    ///
    /// Only an invalid route config is rejected. A route whose endpoints are
    /// not in the last snapshot is accepted with a `StaleIntent` warning,
    /// since the endpoint may come back.
    pub fn submit(&self, intent: Intent) -> Result<IntentOutcome, IntentError> {
        match &intent {
            Intent::AddRoute(route) => route.config.validate()?,
            Intent::SetConfig { config, .. } => config.validate()?,
            Intent::RemoveRoute(_) | Intent::RemoveAllFrom { .. } => {}
        }

        let warning = self.stale_warning(&intent);

        // Re-issuing a route is the user's way to clear a permanent failure.
        if let Intent::AddRoute(route) = &intent {
            self.store.clear_mark(&route.key());
        }

        let (changed, version) = self.store.mutate_desired(|graph| match intent {
            Intent::AddRoute(route) => graph.upsert(route),
            Intent::RemoveRoute(key) => graph.remove(&key),
            Intent::SetConfig { key, config } => graph.set_config(&key, config),
            Intent::RemoveAllFrom { source } => graph.remove_from_source(&source) > 0,
        });

        tracing::debug!(version, changed, "Intent applied");
        self.trigger.fire();

        Ok(IntentOutcome {
            version,
            changed,
            warning,
        })
    }

    fn stale_warning(&self, intent: &Intent) -> Option<IntentError> {
        let Intent::AddRoute(route) = intent else {
            return None;
        };
        if !self.store.has_observed() {
            return None;
        }
        let snapshot = self.store.snapshot();
        let present = snapshot.has_endpoint(&route.source, Direction::Source)
            && snapshot.has_endpoint(&route.sink, Direction::Sink);
        if present {
            None
        } else {
            tracing::warn!(route = %route.key(), "Route references a missing endpoint");
            Some(IntentError::StaleIntent { route: route.key() })
        }
    }
}
