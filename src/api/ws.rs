//! WebSocket push channel for upload progress
//!
//! `GET /ws/upload-progress?token=<jwt>`: the token is verified at connect
//! and the resulting principal scopes which events the connection sees.
//! One write task per connection drains the subscriber queue; the read
//! loop answers `{"type":"ping"}` with a pong and tears the subscription
//! down on close. A dead connection never affects upload progress.

use crate::auth::Principal;
use crate::events::UploadEvent;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// WebSocket upgrade handler; rejects bad tokens before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = params.token else {
        return crate::Error::Unauthorized("token query parameter is required".into())
            .into_response();
    };
    match state.verifier.verify(&token) {
        Ok(principal) => ws.on_upgrade(move |socket| handle_socket(socket, principal, state)),
        Err(err) => err.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, principal: Principal, state: AppState) {
    debug!(principal = %principal.id, "push channel connected");
    let handle = state.bus.subscribe(&principal.id);
    let (mut sender, mut receiver) = socket.split();

    // Write loop: drain the subscriber queue onto the socket.
    let queue = Arc::clone(&handle.queue);
    let write_task = tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize push event"),
            }
        }
        let _ = sender.close().await;
    });

    // Read loop: ping/pong is handled at this sink layer, not on the bus.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
                    .is_some_and(|t| t == "ping");
                if is_ping {
                    handle.queue.push(UploadEvent::Pong {
                        timestamp: Utc::now(),
                    });
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(principal = %principal.id, error = %e, "push channel read error");
                break;
            }
        }
    }

    state.bus.unsubscribe(&handle);
    let _ = write_task.await;
    debug!(principal = %principal.id, "push channel closed");
}
