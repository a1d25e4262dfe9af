//! WebSocket transport for the session manager.

use crate::protocol::Outbound;
use crate::rooms::ConnectionId;
use crate::session::{ConnectionSession, Handshake, SessionManager};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";
pub const AUTH_ROLE_HEADER: &str = "x-auth-role";

/// Frames held back while the handshake is still being checked.
const MAX_PENDING_FRAMES: usize = 64;

pub fn create_router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(manager)
}

async fn ws_handler(
    State(manager): State<Arc<SessionManager>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let handshake = handshake_from_request(&headers, query);
    ws.on_upgrade(move |socket| run_connection(manager, handshake, socket))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn handshake_from_request(headers: &HeaderMap, query: HashMap<String, String>) -> Handshake {
    Handshake {
        auth_token: header_value(headers, AUTH_TOKEN_HEADER),
        auth_role: header_value(headers, AUTH_ROLE_HEADER),
        authorization: header_value(headers, AUTHORIZATION.as_str()),
        query,
    }
}

/// Drives one socket from upgrade to close.
///
/// Inbound frames are handled one at a time in arrival order; outbound
/// events go through an unbounded queue drained by a separate writer task.
pub async fn run_connection(manager: Arc<SessionManager>, handshake: Handshake, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut session = ConnectionSession::new(ConnectionId::new(), tx);
    let conn_id = session.id();
    debug!(conn_id = %conn_id, "New client connecting");

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(conn_id = %conn_id, "Failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Frames sent before the handshake finishes are replayed afterwards. If
    // the client goes away first, authentication is abandoned.
    let mut pending = Vec::new();
    let opened = {
        let open = manager.open(&mut session, &handshake);
        tokio::pin!(open);
        loop {
            tokio::select! {
                result = &mut open => break Some(result.is_ok()),
                message = stream.next() => match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break None,
                    Some(Ok(message)) => {
                        if let Some(text) = frame_text(conn_id, message) {
                            if !hold_pending(&mut pending, text) {
                                warn!(conn_id = %conn_id, "Too many frames before authentication, dropping");
                            }
                        }
                    }
                },
            }
        }
    };

    if opened == Some(true) {
        for text in pending.drain(..) {
            manager.handle_text(&session, &text).await;
        }

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(message) => {
                    if let Some(text) = frame_text(conn_id, message) {
                        manager.handle_text(&session, &text).await;
                    }
                }
                Err(e) => {
                    debug!(conn_id = %conn_id, "WebSocket error: {}", e);
                    break;
                }
            }
        }
    }

    debug!(conn_id = %conn_id, state = ?session.state(), "Client going away");
    manager.close(&mut session);
    // Dropping the session releases the last sender, which stops the writer.
    drop(session);
    let _ = writer.await;
}

/// Payload of a data frame. Binary frames are accepted when they hold UTF-8.
fn frame_text(conn_id: ConnectionId, message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(_) => {
                debug!(conn_id = %conn_id, "Ignoring non-UTF-8 binary frame");
                None
            }
        },
        _ => None,
    }
}

fn hold_pending(pending: &mut Vec<String>, text: String) -> bool {
    if pending.len() >= MAX_PENDING_FRAMES {
        return false;
    }
    pending.push(text);
    true
}
