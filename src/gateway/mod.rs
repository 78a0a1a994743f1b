//! Sound-server gateway
//!
//! The only component that talks to the sound server. Everything above it
//! works against the [`ServerGateway`] trait so tests can substitute
//! [`FakeGateway`].

pub mod args;
pub mod fake;
pub mod pactl;

pub use fake::{FakeGateway, GatewayCall};
pub use pactl::PactlGateway;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::protocol::{ActiveRoute, Endpoint, ModuleHandle, Route};

/// Records returned by a list command.
///
/// Records that fail to parse are skipped and described in `parse_errors`.
/// `complete` is false when the whole listing was unrecognizable, in which
/// case `items` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub parse_errors: Vec<String>,
    pub complete: bool,
}

impl<T> Listing<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            parse_errors: Vec::new(),
            complete: true,
        }
    }

    pub fn unrecognized(error: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            parse_errors: vec![error.into()],
            complete: false,
        }
    }
}

/// Commands the engine issues against the sound server
#[async_trait]
pub trait ServerGateway: Send + Sync {
    /// All sources and sinks.
    async fn list_endpoints(&self) -> Result<Listing<Endpoint>, GatewayError>;

    /// Loaded loopback modules.
    ///
    /// Source and sink hold the references exactly as the server reports
    /// them (endpoint name or index); snapshot assembly resolves them.
    async fn list_active_routes(&self) -> Result<Listing<ActiveRoute>, GatewayError>;

    /// Load a loopback module for `route`. Loading a pair that already
    /// exists succeeds with the existing handle.
    async fn create_route(&self, route: &Route) -> Result<ModuleHandle, GatewayError>;

    /// Unload a module. An already absent handle is not an error.
    async fn remove_route(&self, handle: ModuleHandle) -> Result<(), GatewayError>;

    /// Adjust volume and mute of a loaded route.
    async fn set_route_config(
        &self,
        handle: ModuleHandle,
        volume_percent: u16,
        muted: bool,
    ) -> Result<(), GatewayError>;
}
