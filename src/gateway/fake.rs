//! In-memory gateway for tests and demos.
//!
//! Simulates a sound server with a fixed endpoint set and loopback modules,
//! without any audio stack. Failures are scripted per route or per handle so
//! retry behavior can be asserted exactly.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use super::{Listing, ServerGateway};
use crate::constants::FIRST_FAKE_HANDLE;
use crate::error::GatewayError;
use crate::protocol::{ActiveRoute, Direction, Endpoint, ModuleHandle, Route, RouteKey};

/// One recorded gateway invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    ListEndpoints,
    ListActiveRoutes,
    Create(Route),
    Remove(ModuleHandle),
    SetConfig {
        handle: ModuleHandle,
        volume_percent: u16,
        muted: bool,
    },
}

impl GatewayCall {
    /// Whether the call changes server state
    pub fn is_command(&self) -> bool {
        !matches!(self, GatewayCall::ListEndpoints | GatewayCall::ListActiveRoutes)
    }
}

#[derive(Debug, Clone)]
struct FakeModule {
    route: Route,
    owned: bool,
}

#[derive(Default)]
struct FakeState {
    endpoints: Vec<Endpoint>,
    modules: BTreeMap<ModuleHandle, FakeModule>,
    next_handle: ModuleHandle,
    create_failures: HashMap<RouteKey, VecDeque<GatewayError>>,
    lost_create_replies: HashMap<RouteKey, VecDeque<GatewayError>>,
    remove_failures: HashMap<ModuleHandle, VecDeque<GatewayError>>,
    unavailable: bool,
    create_delay: Option<Duration>,
    calls: Vec<GatewayCall>,
}

/// Deterministic stand-in for the sound server
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_handle: FIRST_FAKE_HANDLE,
                ..FakeState::default()
            }),
        }
    }

    /// Convenience constructor with named sources and sinks
    pub fn with_endpoints(sources: &[&str], sinks: &[&str]) -> Self {
        let gateway = Self::new();
        for source in sources {
            gateway.add_endpoint(source, Direction::Source);
        }
        for sink in sinks {
            gateway.add_endpoint(sink, Direction::Sink);
        }
        gateway
    }

    pub fn add_endpoint(&self, id: &str, direction: Direction) {
        let mut state = self.state.lock();
        let index = state.endpoints.len() as u32 + 1;
        state.endpoints.push(Endpoint {
            id: id.to_string(),
            index,
            name: id.to_string(),
            direction,
            live: true,
        });
    }

    /// Drop an endpoint. Modules referencing it stay loaded, like a server
    /// that has not yet noticed the device is gone.
    pub fn remove_endpoint(&self, id: &str) {
        self.state.lock().endpoints.retain(|e| e.id != id);
    }

    /// Load a module as another tool would, bypassing the call log.
    pub fn insert_module(&self, route: Route, owned: bool) -> ModuleHandle {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.modules.insert(handle, FakeModule { route, owned });
        handle
    }

    /// Unload a module as another tool would, bypassing the call log.
    pub fn unload_externally(&self, handle: ModuleHandle) -> bool {
        self.state.lock().modules.remove(&handle).is_some()
    }

    /// The next `errors.len()` creates for `key` fail with these errors, in order.
    pub fn fail_creates(&self, key: RouteKey, errors: impl IntoIterator<Item = GatewayError>) {
        self.state
            .lock()
            .create_failures
            .entry(key)
            .or_default()
            .extend(errors);
    }

    /// The next `errors.len()` creates for `key` load the module but report
    /// these errors, like a reply lost to a timeout.
    pub fn lose_create_replies(&self, key: RouteKey, errors: impl IntoIterator<Item = GatewayError>) {
        self.state
            .lock()
            .lost_create_replies
            .entry(key)
            .or_default()
            .extend(errors);
    }

    /// The next `errors.len()` removes of `handle` fail with these errors, in order.
    pub fn fail_removes(&self, handle: ModuleHandle, errors: impl IntoIterator<Item = GatewayError>) {
        self.state
            .lock()
            .remove_failures
            .entry(handle)
            .or_default()
            .extend(errors);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Delay every create, to observe routes while they are pending.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.state.lock().create_delay = delay;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    /// Recorded calls that mutate server state
    pub fn commands(&self) -> Vec<GatewayCall> {
        self.calls().into_iter().filter(GatewayCall::is_command).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn create_attempts(&self, key: &RouteKey) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, GatewayCall::Create(route) if route.key() == *key))
            .count()
    }

    pub fn remove_attempts(&self, handle: ModuleHandle) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, GatewayCall::Remove(h) if *h == handle))
            .count()
    }

    /// Loaded modules as (handle, route) pairs, ordered by handle
    pub fn modules(&self) -> Vec<(ModuleHandle, Route)> {
        self.state
            .lock()
            .modules
            .iter()
            .map(|(handle, module)| (*handle, module.route.clone()))
            .collect()
    }

    pub fn module_for(&self, key: &RouteKey) -> Option<ModuleHandle> {
        self.state
            .lock()
            .modules
            .iter()
            .find(|(_, module)| module.route.key() == *key)
            .map(|(handle, _)| *handle)
    }

    fn record(&self, call: GatewayCall) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.unavailable {
            return Err(GatewayError::Unavailable(
                "Connection failure: Connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ServerGateway for FakeGateway {
    async fn list_endpoints(&self) -> Result<Listing<Endpoint>, GatewayError> {
        self.record(GatewayCall::ListEndpoints)?;
        Ok(Listing::new(self.state.lock().endpoints.clone()))
    }

    async fn list_active_routes(&self) -> Result<Listing<ActiveRoute>, GatewayError> {
        self.record(GatewayCall::ListActiveRoutes)?;
        let state = self.state.lock();
        let items = state
            .modules
            .iter()
            .map(|(handle, module)| ActiveRoute {
                route: module.route.clone(),
                handle: *handle,
                owned: module.owned,
            })
            .collect();
        Ok(Listing::new(items))
    }

    async fn create_route(&self, route: &Route) -> Result<ModuleHandle, GatewayError> {
        self.record(GatewayCall::Create(route.clone()))?;

        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let key = route.key();
        if let Some(error) = state
            .create_failures
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let present = |id: &str, direction: Direction| {
            state
                .endpoints
                .iter()
                .any(|e| e.id == id && e.direction == direction)
        };
        if !present(&route.source, Direction::Source) || !present(&route.sink, Direction::Sink) {
            return Err(GatewayError::CreateFailed(
                "Failure: No such entity".to_string(),
            ));
        }

        // The server refuses a second module for the pair; report the existing one.
        if let Some((handle, _)) = state
            .modules
            .iter()
            .find(|(_, module)| module.route.key() == key)
        {
            return Ok(*handle);
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.modules.insert(
            handle,
            FakeModule {
                route: route.clone(),
                owned: true,
            },
        );
        if let Some(error) = state
            .lost_create_replies
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(handle)
    }

    async fn remove_route(&self, handle: ModuleHandle) -> Result<(), GatewayError> {
        self.record(GatewayCall::Remove(handle))?;
        let mut state = self.state.lock();
        if let Some(error) = state
            .remove_failures
            .get_mut(&handle)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        state.modules.remove(&handle);
        Ok(())
    }

    async fn set_route_config(
        &self,
        handle: ModuleHandle,
        volume_percent: u16,
        muted: bool,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::SetConfig {
            handle,
            volume_percent,
            muted,
        })?;
        let mut state = self.state.lock();
        let module = state.modules.get_mut(&handle).ok_or_else(|| {
            GatewayError::ConfigFailed(format!("module {} has no playback stream", handle))
        })?;
        module.route.config.volume_percent = volume_percent;
        module.route.config.muted = muted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RouteConfig;

    #[tokio::test]
    async fn test_create_is_idempotent_per_pair() {
        let gateway = FakeGateway::with_endpoints(&["mic1"], &["spk1"]);
        let route = Route::new("mic1", "spk1", RouteConfig::default());

        let first = gateway.create_route(&route).await.unwrap();
        let second = gateway.create_route(&route).await.unwrap();

        assert_eq!(first, FIRST_FAKE_HANDLE);
        assert_eq!(first, second);
        assert_eq!(gateway.modules().len(), 1);
        assert_eq!(gateway.create_attempts(&route.key()), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let gateway = FakeGateway::with_endpoints(&["mic1"], &["spk1"]);
        let route = Route::new("mic1", "spk1", RouteConfig::default());
        gateway.fail_creates(
            route.key(),
            [GatewayError::Timeout {
                command: "load-module".into(),
                after: Duration::from_secs(1),
            }],
        );

        assert!(gateway.create_route(&route).await.is_err());
        assert!(gateway.create_route(&route).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_permanent() {
        let gateway = FakeGateway::with_endpoints(&["mic1"], &[]);
        let route = Route::new("mic1", "spk1", RouteConfig::default());
        let err = gateway.create_route(&route).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_unavailable_fails_everything() {
        let gateway = FakeGateway::with_endpoints(&["mic1"], &["spk1"]);
        gateway.set_unavailable(true);
        assert!(gateway.list_endpoints().await.unwrap_err().is_unavailable());
        assert!(gateway.remove_route(1).await.unwrap_err().is_unavailable());
    }
}
