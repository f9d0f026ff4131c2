use std::sync::Arc;
use axum::{
    extract::{Query, State, ws::{Message, WebSocket, WebSocketUpgrade}},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::models::StoryId;
use crate::services::auth_service::{authenticate, get_auth_token, Identity};
use super::connctx::Outbound;
use super::hub::SessionHub;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub token: Option<String>,
    pub story_id: Option<StoryId>,
}

/// WebSocket handler. The credential is checked before the upgrade is
/// accepted, so rejected peers never complete the handshake.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    headers: HeaderMap,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    let token = get_auth_token(params.token.as_deref(), &headers);
    let identity = match authenticate(token.as_deref(), app_state.config.jwt_secret.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            // Cause goes to the log only; the peer sees a uniform rejection
            warn!("WebSocket admission rejected: {}", e);
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    info!(user_id = identity.user_id, "New WebSocket connection for {}", identity.username);
    let hub = app_state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, identity, params.story_id, hub))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, identity: Identity, story_id: Option<StoryId>, hub: Arc<SessionHub>) {
    let (conn_id, mut outbound) = hub.admit(identity, story_id).await;

    // Split the socket into sender and receiver
    let (mut sender, mut receiver) = socket.split();

    // Writer: drains this connection's queue. The queue closes when the
    // registry drops the connection, which ends the transport.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let msg = match frame {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Probe => Message::Ping(Vec::new()),
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Reader: one inbound frame at a time, so per-connection handling is sequential.
    // Stop is only observed between frames; a frame being handled runs to completion.
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let reader_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                _ = &mut stop_rx => break,
                next = receiver.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };
            match result {
                Ok(Message::Text(text)) => reader_hub.handle_text(conn_id, &text).await,
                Ok(Message::Pong(_)) => reader_hub.mark_alive(conn_id).await,
                // Pings are answered by the transport
                Ok(Message::Ping(_)) => {}
                Ok(Message::Binary(_)) => {
                    reader_hub.reject_frame(conn_id, "binary frames are not supported").await;
                }
                Ok(Message::Close(frame)) => {
                    debug!(%conn_id, code = ?frame.as_ref().map(|f| f.code), "Client closed connection");
                    break;
                }
                Err(e) => {
                    warn!(%conn_id, "WebSocket transport error: {}", e);
                    break;
                }
            }
        }
    });

    // Writer ending (eviction or a dead socket) stops the reader after its
    // current frame; reader ending drops the writer.
    tokio::select! {
        _ = (&mut send_task) => {
            let _ = stop_tx.send(());
            if let Err(e) = (&mut recv_task).await {
                warn!(%conn_id, "Reader task failed: {}", e);
            }
        }
        _ = (&mut recv_task) => send_task.abort(),
    };

    hub.disconnect(conn_id).await;
    info!(%conn_id, "WebSocket connection terminated");
}
