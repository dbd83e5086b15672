//! Dashboard realtime socket.
//!
//! Handshake: the client passes its JWT as `?token=`; a bad token gets an
//! `auth-error` frame and the connection is closed. A good token joins the
//! caller's `org:{orgId}` room, acknowledged with `auth-success`, after
//! which the socket only ever sees its own org's broadcasts plus a
//! periodic ping.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::http_api::state::ApiState;
use crate::protocol::RoomMessage;
use crate::rooms::org_room;

const HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
pub(crate) struct SocketQuery {
    #[serde(default)]
    token: Option<String>,
}

/// WebSocket GET /socket.
pub(crate) async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SocketQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

async fn send_msg(socket: &mut WebSocket, msg: &RoomMessage) -> bool {
    let json = serde_json::to_string(msg).unwrap_or_default();
    socket.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ApiState>, token: Option<String>) {
    let claims = match token.as_deref().map(|t| state.auth_keys.verify(t)) {
        Some(Ok(claims)) => claims,
        _ => {
            send_msg(
                &mut socket,
                &RoomMessage::AuthError {
                    message: "Invalid or missing token".into(),
                },
            )
            .await;
            let _ = socket.close().await;
            return;
        }
    };

    let rx = state.rooms.subscribe(&org_room(&claims.org_id));
    if !send_msg(
        &mut socket,
        &RoomMessage::AuthSuccess {
            org_id: claims.org_id.clone(),
            user_id: claims.sub.clone(),
            role: claims.role,
        },
    )
    .await
    {
        return;
    }
    debug!(org_id = %claims.org_id, user_id = %claims.sub, "socket joined org room");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat =
        tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            // Forward room broadcasts to this client.
            result = rx.recv_async() => {
                match result {
                    Ok(msg) => {
                        let json = serde_json::to_string(&*msg).unwrap_or_default();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            // Keepalive.
            _ = heartbeat.tick() => {
                let ping = RoomMessage::Ping {
                    timestamp: chrono::Utc::now().to_rfc3339(),
                };
                let json = serde_json::to_string(&ping).unwrap_or_default();
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            // Client messages: only close matters.
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    debug!(org_id = %claims.org_id, "socket disconnected");
}
