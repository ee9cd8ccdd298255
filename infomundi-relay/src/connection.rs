use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::messages::WsMessage;
use crate::state::ServerState;

/// Environment variable holding the shared access token, if any
pub const ACCESS_TOKEN_ENV: &str = "INFOMUNDI_ACCESS_TOKEN";

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let user_id = match wait_for_connect(&mut ws_receiver).await {
        Some(id) => id,
        None => {
            warn!("Connection closed before authentication");
            let reject = WsMessage::AuthResponse {
                success: false,
                message: "Authentication failed".to_string(),
            };
            if let Ok(json) = serde_json::to_string(&reject) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    info!(user_id = %user_id, "User connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.add_client(user_id.clone(), tx.clone());

    let auth_response = WsMessage::AuthResponse {
        success: true,
        message: "Connected to relay".to_string(),
    };
    match serde_json::to_string(&auth_response) {
        Ok(json) => {
            if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                error!("Failed to send auth response to {}: {}", user_id, e);
            }
        }
        Err(e) => {
            error!("Failed to serialize auth response for {}: {}", user_id, e);
        }
    }

    let presence = WsMessage::Presence {
        user_id: user_id.clone(),
        is_online: true,
        last_seen: None,
    };
    match serde_json::to_string(&presence) {
        Ok(json) => state.broadcast(&json, Some(&user_id)),
        Err(e) => error!("Failed to serialize presence for {}: {}", user_id, e),
    }

    // Forward queued frames from the channel to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(&text, &user_id, &state);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("User {} sent close frame", user_id);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error for user {}: {}", user_id, e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended for user {}", user_id);
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => {
                info!("Send task finished for user {} (likely connection lost)", user_id);
                break;
            }
        }
    }

    send_task.abort();
    state.remove_client(&user_id, &tx);
    drop(tx);

    let offline_presence = WsMessage::Presence {
        user_id: user_id.clone(),
        is_online: false,
        last_seen: Some(chrono::Utc::now().timestamp_millis()),
    };
    if let Ok(json) = serde_json::to_string(&offline_presence) {
        state.broadcast(&json, None);
    }

    info!(user_id = %user_id, "User disconnected");
}

/// Wait for the Connect message from a new connection
async fn wait_for_connect(
    receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
) -> Option<String> {
    let expected_token = std::env::var(ACCESS_TOKEN_ENV)
        .ok()
        .filter(|t| !t.is_empty());

    let result = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(text)) = result {
                match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::Connect { user_id, token }) => {
                        if user_id.trim().is_empty() {
                            warn!("Authentication failed: empty user id");
                            return None;
                        }
                        if let Some(expected) = expected_token.as_deref() {
                            if token.as_deref() != Some(expected) {
                                warn!(
                                    "Authentication failed for {}: invalid or missing token",
                                    user_id
                                );
                                return None;
                            }
                        }
                        return Some(user_id);
                    }
                    Ok(other) => {
                        debug!("Ignoring {:?} before authentication", other);
                    }
                    Err(e) => {
                        warn!("Failed to parse Connect message: {}", e);
                    }
                }
            }
        }
        None
    });

    match result.await {
        Ok(user_id) => user_id,
        Err(_) => {
            warn!("Authentication timeout");
            None
        }
    }
}

fn send_json(state: &ServerState, user_id: &str, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            state.send_to_user(user_id, &json);
        }
        Err(e) => error!("Failed to serialize reply for {}: {}", user_id, e),
    }
}

/// Handle an incoming frame from an authenticated connection
pub fn handle_message(text: &str, sender_id: &str, state: &ServerState) {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to parse message from {}: {}", sender_id, e);
            send_json(
                state,
                sender_id,
                &WsMessage::Error {
                    request_id: None,
                    message: "Malformed message".to_string(),
                },
            );
            return;
        }
    };

    match msg {
        WsMessage::SendMessage { to, message } => {
            // Sender and timestamp are always stamped by the relay
            let timestamp = chrono::Utc::now().timestamp_millis();
            state.record_message(sender_id, &to, message.clone(), timestamp);

            let relayed = WsMessage::ReceiveMessage {
                from: sender_id.to_string(),
                message,
                timestamp,
            };
            match serde_json::to_string(&relayed) {
                Ok(json) => {
                    if !state.send_to_user(&to, &json) {
                        debug!(to = %to, "Recipient offline, message kept in history");
                    }
                }
                Err(e) => error!("Failed to serialize message from {}: {}", sender_id, e),
            }
        }
        WsMessage::PublishKey { public_key, .. } => {
            // Keys are always published for the authenticated identity
            state.publish_key(sender_id, public_key);
        }
        WsMessage::KeyRequest {
            request_id,
            user_id,
        } => {
            let public_key = state.public_key(&user_id);
            send_json(
                state,
                sender_id,
                &WsMessage::KeyResponse {
                    request_id,
                    user_id,
                    public_key,
                },
            );
        }
        WsMessage::HistoryRequest {
            request_id,
            peer_id,
        } => {
            // History lookups are always scoped to the requester's own conversations
            let messages = state.history(sender_id, &peer_id);
            send_json(
                state,
                sender_id,
                &WsMessage::HistoryResponse {
                    request_id,
                    messages,
                },
            );
        }
        WsMessage::Connect { .. } => {
            // Already authenticated, ignore
        }
        WsMessage::AuthResponse { .. }
        | WsMessage::ReceiveMessage { .. }
        | WsMessage::KeyResponse { .. }
        | WsMessage::HistoryResponse { .. }
        | WsMessage::Presence { .. }
        | WsMessage::Error { .. } => {
            // Relay-only messages, ignore from client
            debug!("Ignoring relay-only message from {}", sender_id);
        }
    }
}
