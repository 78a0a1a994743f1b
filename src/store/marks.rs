//! Per-route bookkeeping written by the reconciler

use serde::Serialize;

/// Command currently issued for a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlight {
    Creating,
    Removing,
}

/// Reconciler state for one route, beyond what desired/observed imply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMark {
    pub in_flight: Option<InFlight>,
    /// Last command failed transiently; a retry is scheduled
    pub failing: bool,
    /// Last command failed permanently; no retries until unblocked
    pub blocked: bool,
    /// An endpoint of a blocked route has been seen missing since it was blocked
    pub endpoint_gone: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl RouteMark {
    pub fn is_clear(&self) -> bool {
        *self == RouteMark::default()
    }

    pub fn record_success(&mut self) {
        *self = RouteMark::default();
    }

    pub fn record_transient(&mut self, attempts: u32, error: String) {
        self.in_flight = None;
        self.failing = true;
        self.attempts = attempts;
        self.last_error = Some(error);
    }

    pub fn record_permanent(&mut self, error: String) {
        self.in_flight = None;
        self.failing = false;
        self.blocked = true;
        self.endpoint_gone = false;
        self.last_error = Some(error);
    }
}
