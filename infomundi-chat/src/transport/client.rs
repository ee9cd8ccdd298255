use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::messages::WsMessage;
use super::{Directory, InboundCiphertext, MessageHistory, Transport};
use crate::crypto::EncryptedMessage;
use crate::error::{ChatError, ChatResult};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingRequests = Arc<StdMutex<HashMap<String, oneshot::Sender<WsMessage>>>>;

/// Internal message type for the write channel
enum WriteMessage {
    Data(String),
    Close,
}

/// WebSocket client for the relay.
///
/// Serves as the real-time transport, the key directory and the history
/// source at once. Replies are matched to requests by `request_id`.
pub struct WebSocketClient {
    server_url: String,
    user_id: String,
    token: Option<String>,
    request_timeout: Duration,
    write_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<WriteMessage>>>>,
    /// True only between a successful auth response and the connection dropping
    connected: Arc<watch::Sender<bool>>,
    pending: PendingRequests,
    /// Last published key frame, replayed after every (re)connect
    key_announcement: Arc<StdMutex<Option<String>>>,
    inbound_tx: mpsc::UnboundedSender<InboundCiphertext>,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
}

impl WebSocketClient {
    /// Create a client; inbound ciphertexts arrive on the returned receiver
    pub fn new(
        server_url: &str,
        user_id: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<InboundCiphertext>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let (shutdown_tx, _) = broadcast::channel(1);

        let client = Self {
            server_url: server_url.to_string(),
            user_id: user_id.to_string(),
            token,
            request_timeout,
            write_tx: Arc::new(StdMutex::new(None)),
            connected: Arc::new(connected),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            key_announcement: Arc::new(StdMutex::new(None)),
            inbound_tx,
            shutdown_tx,
            started: AtomicBool::new(false),
        };
        (client, inbound_rx)
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolve once authenticated with the relay, or fail after `timeout`
    pub async fn wait_until_connected(&self, timeout: Duration) -> ChatResult<()> {
        let mut rx = self.connected.subscribe();
        let result = tokio::time::timeout(timeout, async {
            rx.wait_for(|connected| *connected).await.map(|_| ())
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChatError::Transport("Client shut down".to_string())),
            Err(_) => Err(ChatError::Transport(format!(
                "Not connected to relay after {:?}",
                timeout
            ))),
        }
    }

    /// Start the background connection task; it reconnects until `disconnect`
    pub async fn connect(&self) -> ChatResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Connection task already running");
            return Ok(());
        }

        let connect_json = serde_json::to_string(&WsMessage::Connect {
            user_id: self.user_id.clone(),
            token: self.token.clone(),
        })?;

        let link = RelayLink {
            server_url: self.server_url.clone(),
            connect_json,
            write_tx: self.write_tx.clone(),
            connected: self.connected.clone(),
            pending: self.pending.clone(),
            key_announcement: self.key_announcement.clone(),
            inbound_tx: self.inbound_tx.clone(),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(link.run(shutdown_rx));
        Ok(())
    }

    /// Gracefully disconnect and stop reconnecting
    pub fn disconnect(&self) {
        info!("Initiating graceful disconnect");
        let _ = self.shutdown_tx.send(());
        if let Ok(guard) = self.write_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(WriteMessage::Close);
            }
        }
    }

    /// Queue a frame for the relay
    pub fn send(&self, message: &WsMessage) -> ChatResult<()> {
        let json = serde_json::to_string(message)?;
        let guard = self
            .write_tx
            .lock()
            .map_err(|e| ChatError::Transport(format!("Lock poisoned: {}", e)))?;

        match guard.as_ref() {
            Some(tx) => tx
                .send(WriteMessage::Data(json))
                .map_err(|_| ChatError::Transport("Connection to relay closed".to_string())),
            None => {
                warn!("Cannot send message: not connected to relay");
                Err(ChatError::Transport("Not connected to relay".to_string()))
            }
        }
    }

    /// Send a request frame and wait for the reply carrying the same id
    async fn request(&self, build: impl FnOnce(String) -> WsMessage) -> ChatResult<WsMessage> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|e| ChatError::Transport(format!("Lock poisoned: {}", e)))?
            .insert(request_id.clone(), tx);

        if let Err(e) = self.send(&build(request_id.clone())) {
            self.forget_request(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ChatError::Transport(
                "Connection lost before reply".to_string(),
            )),
            Err(_) => {
                self.forget_request(&request_id);
                Err(ChatError::Transport(format!(
                    "No reply from relay within {:?}",
                    self.request_timeout
                )))
            }
        }
    }

    fn forget_request(&self, request_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(request_id);
        }
    }
}

#[async_trait]
impl Directory for WebSocketClient {
    async fn publish_public_key(&self, user_id: &str, public_jwk: &str) -> ChatResult<()> {
        let json = serde_json::to_string(&WsMessage::PublishKey {
            user_id: user_id.to_string(),
            public_key: public_jwk.to_string(),
        })?;
        self.key_announcement
            .lock()
            .map_err(|e| ChatError::Transport(format!("Lock poisoned: {}", e)))?
            .replace(json);

        // Offline publishes go out on the next connect
        if self.is_connected() {
            self.send(&WsMessage::PublishKey {
                user_id: user_id.to_string(),
                public_key: public_jwk.to_string(),
            })?;
        }
        Ok(())
    }

    async fn fetch_public_key(&self, user_id: &str) -> ChatResult<Option<String>> {
        let reply = self
            .request(|request_id| WsMessage::KeyRequest {
                request_id,
                user_id: user_id.to_string(),
            })
            .await?;

        match reply {
            WsMessage::KeyResponse { public_key, .. } => Ok(public_key),
            WsMessage::Error { message, .. } => Err(ChatError::Transport(message)),
            other => Err(ChatError::Transport(format!(
                "Unexpected reply to key request: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl MessageHistory for WebSocketClient {
    async fn fetch_messages(&self, peer_id: &str) -> ChatResult<Vec<EncryptedMessage>> {
        let reply = self
            .request(|request_id| WsMessage::HistoryRequest {
                request_id,
                peer_id: peer_id.to_string(),
            })
            .await?;

        match reply {
            WsMessage::HistoryResponse { messages, .. } => Ok(messages
                .into_iter()
                .map(|entry| EncryptedMessage {
                    ciphertext: entry.ciphertext,
                    sender: entry.from,
                    timestamp: entry.timestamp,
                })
                .collect()),
            WsMessage::Error { message, .. } => Err(ChatError::Transport(message)),
            other => Err(ChatError::Transport(format!(
                "Unexpected reply to history request: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Transport for WebSocketClient {
    async fn send_message(&self, to: &str, ciphertext: &str) -> ChatResult<()> {
        self.send(&WsMessage::SendMessage {
            to: to.to_string(),
            message: ciphertext.to_string(),
        })
    }
}

/// State shared between the client handle and its connection task
struct RelayLink {
    server_url: String,
    connect_json: String,
    write_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<WriteMessage>>>>,
    connected: Arc<watch::Sender<bool>>,
    pending: PendingRequests,
    key_announcement: Arc<StdMutex<Option<String>>>,
    inbound_tx: mpsc::UnboundedSender<InboundCiphertext>,
}

impl RelayLink {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Shutdown signal received, stopping reconnection");
                break;
            }

            info!(url = %self.server_url, "Connecting to relay");

            match connect_async(self.server_url.as_str()).await {
                Ok((ws_stream, _)) => {
                    let (mut ws_write, mut ws_read) = ws_stream.split();

                    if ws_write
                        .send(Message::Text(self.connect_json.clone().into()))
                        .await
                        .is_err()
                    {
                        error!("Failed to send connect message");
                    } else if authenticate(&mut ws_read).await {
                        if !self.pump(ws_write, ws_read, &mut shutdown_rx).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, url = %self.server_url, "Failed to connect to relay");
                }
            }

            debug!("Reconnecting in {:?}", RECONNECT_DELAY);
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping reconnection");
                    break;
                }
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// Drive one authenticated connection; returns whether to reconnect
    async fn pump(
        &self,
        mut ws_write: SplitSink<WsStream, Message>,
        mut ws_read: SplitStream<WsStream>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteMessage>();
        let announce_tx = tx.clone();

        if let Ok(mut guard) = self.write_tx.lock() {
            *guard = Some(tx);
        }
        self.connected.send_replace(true);

        // Read after going live so a concurrent publish is never missed
        let announcement = self
            .key_announcement
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(json) = announcement {
            let _ = announce_tx.send(WriteMessage::Data(json));
        }
        drop(announce_tx);

        let mut should_reconnect = true;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection gracefully");
                    if let Err(e) = ws_write.send(Message::Close(None)).await {
                        warn!(error = %e, "Failed to send close frame");
                    }
                    should_reconnect = false;
                    break;
                }
                Some(msg) = rx.recv() => {
                    match msg {
                        WriteMessage::Data(data) => {
                            if ws_write.send(Message::Text(data.into())).await.is_err() {
                                error!("Failed to send message to relay");
                                break;
                            }
                        }
                        WriteMessage::Close => {
                            info!("Close requested, sending close frame");
                            if let Err(e) = ws_write.send(Message::Close(None)).await {
                                warn!(error = %e, "Failed to send close frame");
                            }
                            should_reconnect = false;
                            break;
                        }
                    }
                }
                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            route_frame(&text, &self.inbound_tx, &self.pending);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Relay closed connection");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Ok(mut guard) = self.write_tx.lock() {
            *guard = None;
        }
        self.connected.send_replace(false);
        // Dropping the senders fails every in-flight request
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        info!("Disconnected from relay");

        should_reconnect
    }
}

/// Wait for the relay's auth response
async fn authenticate(ws_read: &mut SplitStream<WsStream>) -> bool {
    let result = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::AuthResponse { success, message }) => {
                        if success {
                            info!("Authenticated with relay: {}", message);
                        } else {
                            error!("Authentication failed: {}", message);
                        }
                        return success;
                    }
                    Ok(_) => debug!("Ignoring frame before auth response"),
                    Err(e) => warn!(error = %e, "Unparseable frame during auth"),
                },
                Ok(Message::Close(_)) => return false,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "WebSocket error during auth");
                    return false;
                }
            }
        }
        false
    });

    match result.await {
        Ok(success) => success,
        Err(_) => {
            warn!("Authentication timeout");
            false
        }
    }
}

/// Dispatch one relay frame to the inbound channel or a waiting request
fn route_frame(
    text: &str,
    inbound_tx: &mpsc::UnboundedSender<InboundCiphertext>,
    pending: &PendingRequests,
) {
    let msg = match serde_json::from_str::<WsMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Failed to parse frame from relay");
            return;
        }
    };

    if let Some(request_id) = msg.request_id().map(str::to_string) {
        let waiter = pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&request_id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => debug!(request_id = %request_id, "Reply for unknown or expired request"),
        }
        return;
    }

    match msg {
        WsMessage::ReceiveMessage {
            from,
            message,
            timestamp,
        } => {
            debug!(from = %from, len = message.len(), "Ciphertext received");
            let _ = inbound_tx.send(InboundCiphertext {
                from,
                message,
                timestamp,
            });
        }
        WsMessage::Presence {
            user_id, is_online, ..
        } => {
            debug!(user_id = %user_id, is_online, "Presence update");
        }
        WsMessage::Error { message, .. } => {
            warn!("Relay reported error: {}", message);
        }
        other => {
            debug!("Ignoring unexpected frame: {:?}", other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> PendingRequests {
        Arc::new(StdMutex::new(HashMap::new()))
    }

    #[test]
    fn test_receive_message_goes_to_inbound() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let json = r#"{"type":"receive_message","from":"bob","message":"c1","timestamp":7}"#;

        route_frame(json, &tx, &pending());

        assert_eq!(
            rx.try_recv().unwrap(),
            InboundCiphertext {
                from: "bob".to_string(),
                message: "c1".to_string(),
                timestamp: 7,
            }
        );
    }

    #[test]
    fn test_reply_resolves_pending_request() {
        let (tx, mut inbound) = mpsc::unbounded_channel();
        let pending = pending();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        pending.lock().unwrap().insert("r1".to_string(), reply_tx);

        let json = r#"{"type":"key_response","request_id":"r1","user_id":"bob","public_key":"jwk"}"#;
        route_frame(json, &tx, &pending);

        match reply_rx.try_recv().unwrap() {
            WsMessage::KeyResponse { public_key, .. } => {
                assert_eq!(public_key.as_deref(), Some("jwk"));
            }
            other => panic!("Expected KeyResponse, got {:?}", other),
        }
        assert!(pending.lock().unwrap().is_empty());
        assert!(inbound.try_recv().is_err());
    }

    #[test]
    fn test_unknown_reply_and_garbage_are_dropped() {
        let (tx, mut inbound) = mpsc::unbounded_channel();
        let pending = pending();

        route_frame(
            r#"{"type":"history_response","request_id":"gone","messages":[]}"#,
            &tx,
            &pending,
        );
        route_frame("not json", &tx, &pending);

        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_fails_when_not_connected() {
        let (client, _inbound) =
            WebSocketClient::new("ws://127.0.0.1:1", "alice", None, Duration::from_secs(1));

        assert!(!client.is_connected());
        let err = client.send_message("bob", "c1").await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));

        let err = client.fetch_public_key("bob").await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
        assert!(client.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_connected_times_out() {
        let (client, _inbound) =
            WebSocketClient::new("ws://127.0.0.1:1", "alice", None, Duration::from_secs(1));

        let err = client
            .wait_until_connected(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }

    #[tokio::test]
    async fn test_wait_until_connected_sees_later_connection() {
        let (client, _inbound) =
            WebSocketClient::new("ws://127.0.0.1:1", "alice", None, Duration::from_secs(1));

        let connected = client.connected.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            connected.send_replace(true);
        });

        client
            .wait_until_connected(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(client.is_connected());
    }
}
