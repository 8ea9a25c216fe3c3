//! WebSocket endpoint.
//!
//! Clients connect to `/ws`, send [`ClientAction`]s and receive direct replies
//! interleaved with events from every stream they follow.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::protocol::{ClientAction, ServerMessage};
use crate::AppState;

/// Handler for GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut events) = mpsc::unbounded_channel();
    let mut connection = Connection::new(state.manager.clone(), sink);

    log::debug!("WebSocket client connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::debug!("WebSocket receive error: {}", e);
                        break;
                    }
                };

                let replies = match serde_json::from_str::<ClientAction>(text.as_str()) {
                    Ok(action) => connection.handle(action).await,
                    Err(e) => vec![ServerMessage::error(None, format!("Invalid action: {}", e))],
                };
                if !send_all(&mut sender, &replies).await {
                    break;
                }
            }
            Some(message) = events.recv() => {
                if !send_all(&mut sender, &[ServerMessage::Event(message)]).await {
                    break;
                }
            }
        }
    }

    // Dropping the connection detaches every subscription.
    drop(connection);
    log::debug!("WebSocket connection closed");
}

/// Returns false once the client is gone.
async fn send_all(sender: &mut SplitSink<WebSocket, Message>, messages: &[ServerMessage]) -> bool {
    for message in messages {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to serialize server message: {}", e);
                continue;
            }
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            return false;
        }
    }
    true
}
