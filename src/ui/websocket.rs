//! WebSocket push of topology views

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use std::sync::Arc;
use tokio::sync::watch;

use crate::protocol::TopologyView;
use crate::ui::server::AppState;

/// Upgrade and stream every published view as JSON
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let views = state.engine.subscribe();
    ws.on_upgrade(move |socket| push_views(socket, views))
}

async fn push_views(mut socket: WebSocket, mut views: watch::Receiver<Arc<TopologyView>>) {
    tracing::debug!("View subscriber connected");

    if send_current(&mut socket, &mut views).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() || send_current(&mut socket, &mut views).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Read-only channel; intents go through the HTTP API
                Some(Ok(_)) => {}
            }
        }
    }

    tracing::debug!("View subscriber disconnected");
}

async fn send_current(
    socket: &mut WebSocket,
    views: &mut watch::Receiver<Arc<TopologyView>>,
) -> Result<(), axum::Error> {
    let view = views.borrow_and_update().clone();
    match serde_json::to_string(&*view) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            tracing::warn!("Failed to serialize topology view: {}", e);
            Ok(())
        }
    }
}
