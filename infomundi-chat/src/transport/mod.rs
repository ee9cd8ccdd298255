//! Collaborators of the chat core: key directory, message history and the
//! real-time transport, plus their implementations.

mod client;
mod http;
pub mod memory;
mod messages;

pub use client::WebSocketClient;
pub use http::HttpDirectory;
pub use messages::{HistoryEntry, WsMessage};

use async_trait::async_trait;

use crate::crypto::EncryptedMessage;
use crate::error::ChatResult;

/// Stores and serves users' public keys by identifier
#[async_trait]
pub trait Directory: Send + Sync {
    /// Upsert the public key (JWK) for `user_id`
    async fn publish_public_key(&self, user_id: &str, public_jwk: &str) -> ChatResult<()>;

    /// `None` if the user never published a key
    async fn fetch_public_key(&self, user_id: &str) -> ChatResult<Option<String>>;
}

/// Serves the stored ciphertexts of a conversation
#[async_trait]
pub trait MessageHistory: Send + Sync {
    /// Messages between the local user and `peer_id`, oldest first
    async fn fetch_messages(&self, peer_id: &str) -> ChatResult<Vec<EncryptedMessage>>;
}

/// Outbound half of the real-time transport
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, to: &str, ciphertext: &str) -> ChatResult<()>;
}

/// Inbound ciphertext as emitted by the transport (`receive_message`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCiphertext {
    pub from: String,
    pub message: String,
    pub timestamp: i64,
}
