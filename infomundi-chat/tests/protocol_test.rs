//! End-to-end protocol scenarios over the in-memory network
//!
//! Two independent identities exchange keys through a shared directory and
//! talk without either side ever seeing the other's private key.

use std::sync::Arc;

use infomundi_chat::crypto::{
    cipher, derive_session_key, KeyStore, LocalKeyPair, MemoryKeyStorage, PeerPublicKey,
    SqliteKeyStorage,
};
use infomundi_chat::db::Database;
use infomundi_chat::models::{DeliveryStatus, MessageBody, UNDECRYPTABLE_PLACEHOLDER};
use infomundi_chat::transport::memory::{MemoryEndpoint, MemoryNetwork};
use infomundi_chat::transport::InboundCiphertext;
use infomundi_chat::{ChatError, ChatSession, InboundOutcome, KeyExchange, SessionState};
use tokio::sync::mpsc::UnboundedReceiver;

async fn session_for(
    network: &MemoryNetwork,
    user_id: &str,
    local: LocalKeyPair,
) -> (ChatSession, UnboundedReceiver<InboundCiphertext>) {
    let (endpoint, inbound) = network.join(user_id);
    let endpoint: Arc<MemoryEndpoint> = Arc::new(endpoint);
    let exchange = KeyExchange::new(user_id, endpoint.clone());
    exchange.publish_public_key(&local).await.unwrap();

    let session = ChatSession::new(Arc::new(local), exchange, endpoint.clone(), endpoint);
    (session, inbound)
}

fn fresh_identity() -> LocalKeyPair {
    KeyStore::new(Arc::new(MemoryKeyStorage::new()))
        .ensure_local_key_pair()
        .unwrap()
}

#[test]
fn test_both_sides_derive_the_same_key() {
    let alice = fresh_identity();
    let bob = fresh_identity();

    let alice_view = PeerPublicKey::from_jwk("bob", &bob.public_jwk()).unwrap();
    let bob_view = PeerPublicKey::from_jwk("alice", &alice.public_jwk()).unwrap();

    let k_ab = derive_session_key(&alice, &alice_view).unwrap();
    let k_ba = derive_session_key(&bob, &bob_view).unwrap();
    assert_eq!(k_ab.as_bytes(), k_ba.as_bytes());

    let ciphertext = cipher::encrypt(&k_ab, "hello").unwrap();
    assert_eq!(cipher::decrypt(&k_ba, &ciphertext).unwrap(), "hello");
}

#[tokio::test]
async fn test_hello_from_alice_to_bob() {
    let network = MemoryNetwork::new();
    let (mut alice, mut alice_inbound) = session_for(&network, "alice", fresh_identity()).await;
    let (mut bob, mut bob_inbound) = session_for(&network, "bob", fresh_identity()).await;

    alice.open("bob").await.unwrap();
    alice.send("hello").await.unwrap();

    // Bob is not looking at the conversation yet: notification only
    let inbound = bob_inbound.recv().await.unwrap();
    assert_eq!(bob.on_inbound(&inbound), InboundOutcome::Notified);
    assert_eq!(bob.take_notifications()[0].from, "alice");

    // Opening the conversation recovers the message from history
    bob.open("alice").await.unwrap();
    let transcript = bob.transcript();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].sender, "alice");
    assert_eq!(transcript[0].body, MessageBody::Plaintext("hello".to_string()));
    assert_eq!(transcript[0].delivery, DeliveryStatus::Received);

    // And the reply arrives live
    bob.send("hi alice").await.unwrap();
    let reply = alice_inbound.recv().await.unwrap();
    assert_eq!(alice.on_inbound(&reply), InboundOutcome::Displayed);
    assert_eq!(alice.transcript()[1].body.display_text(), "hi alice");
}

#[tokio::test]
async fn test_unpublished_peer_cannot_be_opened() {
    let network = MemoryNetwork::new();
    let (mut alice, _inbound) = session_for(&network, "alice", fresh_identity()).await;

    let err = alice.open("bob").await.unwrap_err();
    assert!(matches!(err, ChatError::PeerKeyUnavailable(_)));
    assert!(matches!(alice.state(), SessionState::Closed));
    assert!(!alice.is_composer_enabled());
}

#[tokio::test]
async fn test_rotated_peer_key_makes_old_history_unreadable() {
    let network = MemoryNetwork::new();
    let (mut alice, _a) = session_for(&network, "alice", fresh_identity()).await;
    let (mut bob, _b) = session_for(&network, "bob", fresh_identity()).await;

    bob.open("alice").await.unwrap();
    bob.send("before rotation").await.unwrap();

    // Bob's storage was wiped and a new identity published
    let (mut new_bob, _b2) = session_for(&network, "bob", fresh_identity()).await;
    new_bob.open("alice").await.unwrap();
    new_bob.send("after rotation").await.unwrap();

    alice.open("bob").await.unwrap();
    let texts: Vec<&str> = alice
        .transcript()
        .iter()
        .map(|entry| entry.body.display_text())
        .collect();
    assert_eq!(texts, vec![UNDECRYPTABLE_PLACEHOLDER, "after rotation"]);
}

#[tokio::test]
async fn test_persisted_identity_reads_old_history_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("alice.db");
    let network = MemoryNetwork::new();
    let (mut bob, _b) = session_for(&network, "bob", fresh_identity()).await;

    let load_alice = || {
        let db = Arc::new(Database::open(&db_path).unwrap());
        KeyStore::new(Arc::new(SqliteKeyStorage::new(db, "alice")))
            .ensure_local_key_pair()
            .unwrap()
    };

    let first_run = load_alice();
    let first_public = first_run.public_jwk();
    let (alice, _a) = session_for(&network, "alice", first_run).await;
    drop(alice);

    bob.open("alice").await.unwrap();
    bob.send("while you were away").await.unwrap();

    let second_run = load_alice();
    assert_eq!(second_run.public_jwk(), first_public);

    let (mut alice, _a) = session_for(&network, "alice", second_run).await;
    alice.open("bob").await.unwrap();
    assert_eq!(
        alice.transcript()[0].body.display_text(),
        "while you were away"
    );
}
