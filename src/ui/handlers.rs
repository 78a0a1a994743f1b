//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::error::{Error, IntentError};
use crate::intent::{Intent, IntentOutcome};
use crate::protocol::{Endpoint, Route, RouteConfig, RouteKey, RouteStatus};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Engine status
#[derive(Debug, serde::Serialize)]
pub struct SystemStatus {
    pub connected: bool,
    pub desired_version: u64,
    pub polling_paused: bool,
    pub endpoint_count: usize,
    pub route_count: usize,
    pub last_error: Option<String>,
}

/// Get engine status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let view = state.engine.latest_view();
    let status = SystemStatus {
        connected: view.connected,
        desired_version: view.desired_version,
        polling_paused: state.engine.is_polling_paused(),
        endpoint_count: view.snapshot.endpoints.len(),
        route_count: view.routes.len(),
        last_error: view.last_error.clone(),
    };

    Json(ApiResponse::ok(status))
}

/// Get endpoints of the last snapshot
pub async fn get_endpoints(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<Endpoint>>> {
    Json(ApiResponse::ok(state.engine.snapshot().endpoints.clone()))
}

/// Get the status of every known route
pub async fn get_routes(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<RouteStatus>>> {
    Json(ApiResponse::ok(state.engine.view().routes))
}

/// Add or replace a desired route
pub async fn add_route(
    State(state): State<Arc<AppState>>,
    Json(route): Json<Route>,
) -> (StatusCode, Json<ApiResponse<IntentOutcome>>) {
    submit(&state, Intent::AddRoute(route), StatusCode::CREATED)
}

/// Remove a desired route
pub async fn remove_route(
    State(state): State<Arc<AppState>>,
    Path((source, sink)): Path<(String, String)>,
) -> (StatusCode, Json<ApiResponse<IntentOutcome>>) {
    submit(&state, Intent::RemoveRoute(RouteKey::new(source, sink)), StatusCode::OK)
}

/// Change latency, volume or mute of a desired route
pub async fn set_route_config(
    State(state): State<Arc<AppState>>,
    Path((source, sink)): Path<(String, String)>,
    Json(config): Json<RouteConfig>,
) -> (StatusCode, Json<ApiResponse<IntentOutcome>>) {
    let key = RouteKey::new(source, sink);
    if !state.engine.desired().contains(&key) {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Route {} is not desired", key))),
        );
    }
    submit(&state, Intent::SetConfig { key, config }, StatusCode::OK)
}

/// Remove every route fed by a source
pub async fn remove_all_from_source(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> (StatusCode, Json<ApiResponse<IntentOutcome>>) {
    submit(&state, Intent::RemoveAllFrom { source }, StatusCode::OK)
}

/// Observe and reconcile now
pub async fn refresh(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    state.engine.refresh();
    Json(ApiResponse::ok(()))
}

pub async fn pause_poller(State(state): State<Arc<AppState>>) -> Json<ApiResponse<bool>> {
    state.engine.pause_polling();
    Json(ApiResponse::ok(state.engine.is_polling_paused()))
}

pub async fn resume_poller(State(state): State<Arc<AppState>>) -> Json<ApiResponse<bool>> {
    state.engine.resume_polling();
    Json(ApiResponse::ok(state.engine.is_polling_paused()))
}

fn submit(
    state: &AppState,
    intent: Intent,
    success: StatusCode,
) -> (StatusCode, Json<ApiResponse<IntentOutcome>>) {
    match state.engine.submit(intent) {
        Ok(outcome) => (success, Json(ApiResponse::ok(outcome))),
        Err(e @ Error::Intent(IntentError::InvalidConfig(_))) => {
            (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string())))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}
