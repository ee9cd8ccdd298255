//! In-process loopback network, the relay's behavior without sockets.
//!
//! Every participant joins one [`MemoryNetwork`] and gets an endpoint that
//! acts as its directory, history source and transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Directory, InboundCiphertext, MessageHistory, Transport};
use crate::crypto::EncryptedMessage;
use crate::error::{ChatError, ChatResult};

#[derive(Default)]
struct NetworkState {
    keys: HashMap<String, String>,
    history: HashMap<(String, String), Vec<EncryptedMessage>>,
    inboxes: HashMap<String, mpsc::UnboundedSender<InboundCiphertext>>,
    offline: bool,
}

fn conversation_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `user_id`; a later join for the same user replaces its inbox
    pub fn join(
        &self,
        user_id: &str,
    ) -> (MemoryEndpoint, mpsc::UnboundedReceiver<InboundCiphertext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.inboxes.insert(user_id.to_string(), tx);
        }
        let endpoint = MemoryEndpoint {
            user_id: user_id.to_string(),
            state: self.state.clone(),
        };
        (endpoint, rx)
    }

    /// While offline every operation fails with a transport error
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    /// Store a raw key without going through an endpoint
    pub fn put_public_key(&self, user_id: &str, public_jwk: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.keys.insert(user_id.to_string(), public_jwk.to_string());
        }
    }

    /// Append a stored message to the conversation between `message.sender` and `peer_id`
    pub fn put_history(&self, peer_id: &str, message: EncryptedMessage) {
        if let Ok(mut state) = self.state.lock() {
            state
                .history
                .entry(conversation_key(&message.sender, peer_id))
                .or_default()
                .push(message);
        }
    }
}

/// One participant's view of a [`MemoryNetwork`]
pub struct MemoryEndpoint {
    user_id: String,
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryEndpoint {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut NetworkState) -> T) -> ChatResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ChatError::Transport("Network lock poisoned".to_string()))?;
        if state.offline {
            return Err(ChatError::Transport("Network offline".to_string()));
        }
        Ok(f(&mut state))
    }
}

#[async_trait]
impl Directory for MemoryEndpoint {
    async fn publish_public_key(&self, user_id: &str, public_jwk: &str) -> ChatResult<()> {
        self.with_state(|state| {
            state.keys.insert(user_id.to_string(), public_jwk.to_string());
        })
    }

    async fn fetch_public_key(&self, user_id: &str) -> ChatResult<Option<String>> {
        self.with_state(|state| state.keys.get(user_id).cloned())
    }
}

#[async_trait]
impl MessageHistory for MemoryEndpoint {
    async fn fetch_messages(&self, peer_id: &str) -> ChatResult<Vec<EncryptedMessage>> {
        self.with_state(|state| {
            state
                .history
                .get(&conversation_key(&self.user_id, peer_id))
                .cloned()
                .unwrap_or_default()
        })
    }
}

#[async_trait]
impl Transport for MemoryEndpoint {
    async fn send_message(&self, to: &str, ciphertext: &str) -> ChatResult<()> {
        self.with_state(|state| {
            let timestamp = chrono::Utc::now().timestamp_millis();
            state
                .history
                .entry(conversation_key(&self.user_id, to))
                .or_default()
                .push(EncryptedMessage {
                    ciphertext: ciphertext.to_string(),
                    sender: self.user_id.clone(),
                    timestamp,
                });

            if let Some(inbox) = state.inboxes.get(to) {
                let _ = inbox.send(InboundCiphertext {
                    from: self.user_id.clone(),
                    message: ciphertext.to_string(),
                    timestamp,
                });
            }
        })
    }
}
