use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crypto::{LocalKeyPair, PeerPublicKey};
use crate::error::{ChatError, ChatResult};
use crate::transport::Directory;

/// Publishes the local public key and looks up peers' keys
#[derive(Clone)]
pub struct KeyExchange {
    user_id: String,
    directory: Arc<dyn Directory>,
}

impl KeyExchange {
    pub fn new(user_id: &str, directory: Arc<dyn Directory>) -> Self {
        Self {
            user_id: user_id.to_string(),
            directory,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Upsert our public key so peers can derive a session with us
    pub async fn publish_public_key(&self, key_pair: &LocalKeyPair) -> ChatResult<()> {
        self.directory
            .publish_public_key(&self.user_id, &key_pair.public_jwk())
            .await?;
        info!(
            user_id = %self.user_id,
            fingerprint = %key_pair.fingerprint(),
            "Public key published"
        );
        Ok(())
    }

    /// Fetch and parse a peer's public key. Never retried here.
    pub async fn fetch_peer_public_key(&self, peer_id: &str) -> ChatResult<PeerPublicKey> {
        let jwk = match self.directory.fetch_public_key(peer_id).await? {
            Some(jwk) => jwk,
            None => {
                warn!(peer_id, "Peer has not published a public key");
                return Err(ChatError::PeerKeyUnavailable(peer_id.to_string()));
            }
        };

        let peer_key = PeerPublicKey::from_jwk(peer_id, &jwk)?;
        debug!(peer_id, fingerprint = %peer_key.fingerprint(), "Fetched peer public key");
        Ok(peer_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;

    #[tokio::test]
    async fn test_published_key_is_fetchable_by_peer() {
        let network = MemoryNetwork::new();
        let (alice_ep, _a) = network.join("alice");
        let (bob_ep, _b) = network.join("bob");

        let alice_key = LocalKeyPair::generate();
        KeyExchange::new("alice", Arc::new(alice_ep))
            .publish_public_key(&alice_key)
            .await
            .unwrap();

        let fetched = KeyExchange::new("bob", Arc::new(bob_ep))
            .fetch_peer_public_key("alice")
            .await
            .unwrap();
        assert_eq!(fetched.key(), alice_key.public_key());
        assert_eq!(fetched.peer_id, "alice");
    }

    #[tokio::test]
    async fn test_missing_key_is_peer_key_unavailable() {
        let network = MemoryNetwork::new();
        let (ep, _rx) = network.join("alice");

        let err = KeyExchange::new("alice", Arc::new(ep))
            .fetch_peer_public_key("ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PeerKeyUnavailable(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_malformed_key_is_key_agreement_error() {
        let network = MemoryNetwork::new();
        network.put_public_key("bob", r#"{"kty":"OKP","crv":"X25519","x":"AAAA"}"#);
        let (ep, _rx) = network.join("alice");

        let err = KeyExchange::new("alice", Arc::new(ep))
            .fetch_peer_public_key("bob")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::KeyAgreement(_)));
    }

    #[tokio::test]
    async fn test_directory_failure_is_transport_error() {
        let network = MemoryNetwork::new();
        let (ep, _rx) = network.join("alice");
        network.set_offline(true);

        let exchange = KeyExchange::new("alice", Arc::new(ep));
        let err = exchange.fetch_peer_public_key("bob").await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));

        let err = exchange
            .publish_public_key(&LocalKeyPair::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }
}
