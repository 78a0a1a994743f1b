//! HTTP control surface
//!
//! JSON API and WebSocket push over an [`EngineHandle`](crate::EngineHandle),
//! for presentation layers running in another process.

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{AppState, WebServer};
