use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, RawQuery, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::config::get_config;
use crate::models::{AppError, ClientMessage, PongMessage, ServerMessage};
use crate::room::RoomCmd;
use crate::AppState;

/// WebSocket upgrade for `/ws/:doc_id`. Authentication and the
/// owner-or-collaborator check both run before the upgrade, so a rejected
/// caller gets a proper HTTP error and never causes a room to spin up.
pub async fn websocket_handler(
    Path(doc_id): Path<Uuid>,
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match crate::services::auth_service::get_auth_token(&headers, query.as_deref()) {
        Ok(token) => token,
        Err(e) => return AppError::Auth(e).into_response(),
    };
    let identity = match app_state.gate.authenticate(&token) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = app_state.gate.authorize(&identity, doc_id).await {
        return e.into_response();
    }

    info!(
        "User '{}' opening websocket for document {}",
        identity.user_id, doc_id
    );
    ws.on_upgrade(move |socket| handle_socket(socket, doc_id, identity, app_state))
}

async fn handle_socket(
    socket: WebSocket,
    doc_id: Uuid,
    identity: Identity,
    app_state: Arc<AppState>,
) {
    let conn_id = Uuid::new_v4();
    let config = get_config();
    let idle_timeout = config.ws_idle_timeout();

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(config.outbound_queue);

    // The join handshake (init + awarenessState) is queued on out_tx before
    // this returns.
    let room_tx = match app_state.registry.join(doc_id, conn_id, &identity, &out_tx).await {
        Ok(tx) => tx,
        Err(e) => {
            warn!(
                "Connection {} could not join room {}: {}",
                conn_id, doc_id, e
            );
            let _ = sink.close().await;
            return;
        }
    };

    // Only the room holds a strong sender from here on. When it drops this
    // connection (leave, slow consumer, protocol error) the pump below sees
    // the channel close and the whole socket tears down.
    let out_weak = out_tx.downgrade();
    drop(out_tx);

    // Pump queued server messages onto the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize a server message: {}", e);
                    break;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Read loop with an idle cutoff; a silent client is assumed gone.
    let room_tx_reader = room_tx.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    debug!("Websocket error on connection {}: {}", conn_id, e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    info!(
                        "Connection {} idle for {:?}, closing",
                        conn_id, idle_timeout
                    );
                    break;
                }
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Binary(_) => {
                    warn!("Connection {} sent a binary frame, closing", conn_id);
                    break;
                }
            };

            let msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(
                        "Connection {} sent a malformed message, closing: {}",
                        conn_id, e
                    );
                    break;
                }
            };

            let cmd = match msg {
                // Liveness probe, answered here without bothering the room.
                ClientMessage::Ping => {
                    let pong = ServerMessage::Pong(PongMessage {
                        date: chrono::Utc::now().to_rfc3339(),
                    });
                    match out_weak.upgrade() {
                        Some(tx) => {
                            let _ = tx.try_send(pong);
                            continue;
                        }
                        // The room already dropped us.
                        None => break,
                    }
                }
                ClientMessage::Update(u) => RoomCmd::Update {
                    conn_id,
                    update: u.update,
                },
                ClientMessage::Awareness(a) => RoomCmd::Awareness {
                    conn_id,
                    payload: a.payload,
                },
                ClientMessage::SyncRequest(s) => RoomCmd::SyncRequest {
                    conn_id,
                    version: s.version,
                },
            };
            if room_tx_reader.send(cmd).await.is_err() {
                break;
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    // Idempotent; the room may have dropped this connection already.
    let _ = room_tx.send(RoomCmd::Leave { conn_id }).await;
    info!(
        "Websocket connection {} for document {} terminated",
        conn_id, doc_id
    );
}
