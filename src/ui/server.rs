//! HTTP server setup

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use super::{handlers, websocket};
use crate::config::UiConfig;
use crate::engine::EngineHandle;

/// Shared state for handlers
pub struct AppState {
    pub engine: Arc<EngineHandle>,
}

/// Control surface server
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, engine: Arc<EngineHandle>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { engine }),
        }
    }

    /// Build the router with all API routes
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/endpoints", get(handlers::get_endpoints))
            .route("/api/routes", get(handlers::get_routes).post(handlers::add_route))
            .route("/api/routes/:source/:sink", delete(handlers::remove_route))
            .route("/api/routes/:source/:sink/config", put(handlers::set_route_config))
            .route("/api/sources/:source/routes", delete(handlers::remove_all_from_source))
            .route("/api/refresh", post(handlers::refresh))
            .route("/api/poller/pause", post(handlers::pause_poller))
            .route("/api/poller/resume", post(handlers::resume_poller))
            .route("/ws", get(websocket::ws_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Control surface listening on http://{}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
    }

    /// Serve on a background task; failures are logged.
    pub fn start_background(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(shutdown).await {
                tracing::error!("Control surface failed: {}", e);
            }
        })
    }
}
