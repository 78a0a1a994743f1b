//! # Loopback Router
//!
//! Keeps a sound server's loopback modules in line with a desired
//! source-to-sink routing graph.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                  Presentation (CLI / HTTP / WebSocket)                  │
//! │        EngineHandle::submit(Intent)     EngineHandle::subscribe()       │
//! └───────────────┬────────────────────────────────────▲──────────────────┘
//!                 │                                    │ TopologyView
//!                 ▼                                    │
//! ┌─────────────────────────────┐        ┌─────────────┴─────────────────┐
//! │   Intent Queue (intent)      │──────▶│     Topology Store (store)     │
//! │   validate, mutate_desired   │        │  snapshot │ desired+version   │
//! └───────────────┬─────────────┘        │  route marks │ connectivity    │
//!                 │ fire                  └─────────────▲─────────────────┘
//!                 ▼                                      │ replace_snapshot
//! ┌─────────────────────────────┐        ┌──────────────┴────────────────┐
//! │   Trigger (coalescing)       │──────▶│     Reconciler (reconciler)     │
//! └───────────────▲─────────────┘        │  observe → plan → dispatch      │
//!                 │ tick                  │  removes before creates         │
//! ┌───────────────┴─────────────┐        │  backoff per action             │
//! │   Poller (poller)            │        └──────────────┬────────────────┘
//! │   interval │ pause │ force   │                       │
//! └─────────────────────────────┘                       ▼
//!                                         ┌───────────────────────────────┐
//!                                         │  Server Gateway (gateway)      │
//!                                         │  pactl list / load / unload    │
//!                                         └──────────────┬────────────────┘
//!                                                        │ process
//!                                                        ▼
//!                                                  Sound server
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod intent;
pub mod poller;
pub mod protocol;
pub mod reconciler;
pub mod store;
#[cfg(feature = "ui")]
pub mod ui;

pub use engine::{EngineHandle, RoutingEngine};
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default loopback latency in milliseconds
    pub const DEFAULT_LATENCY_MS: u32 = 20;

    /// Latency module-loopback assumes when `latency_msec` is absent
    pub const SERVER_DEFAULT_LATENCY_MS: u32 = 200;

    /// Unity gain
    pub const DEFAULT_VOLUME_PERCENT: u16 = 100;

    /// Highest accepted volume, allows boost
    pub const MAX_VOLUME_PERCENT: u16 = 150;

    /// First retry delay after a transient failure
    pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;

    /// Retry delay ceiling
    pub const DEFAULT_BACKOFF_CAP_MS: u64 = 8_000;

    /// Observation interval
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

    /// Bound on every sound-server command
    pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

    /// Gateway commands in flight per dispatch phase
    pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

    /// Plans recomputed within one pass before handing over to a new pass
    pub const MAX_RECOMPUTES: u32 = 4;

    /// Default HTTP port for the control surface
    pub const DEFAULT_HTTP_PORT: u16 = 8765;

    /// Marker written into modules this engine loads
    pub const DEFAULT_OWNER_TAG: &str = "loopback-router";

    /// Server module implementing a route
    pub const LOOPBACK_MODULE: &str = "module-loopback";

    /// First handle the fake gateway assigns
    pub const FIRST_FAKE_HANDLE: u32 = 42;
}
