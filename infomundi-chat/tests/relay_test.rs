//! Chat clients talking through a real relay started in-process

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use infomundi_chat::logging::LogConfig;
use infomundi_chat::models::{DeliveryStatus, MessageBody};
use infomundi_chat::transport::{Directory, WebSocketClient};
use infomundi_chat::{start, ChatConfig, ChatError, ChatHandle, InboundOutcome, KeyStoreBackend};
use tokio::net::TcpListener;
use tokio::time::timeout;

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(infomundi_relay::ServerState::new());
    tokio::spawn(infomundi_relay::serve(listener, state));
    format!("ws://127.0.0.1:{}", port)
}

fn config(relay_url: &str, user_id: &str) -> ChatConfig {
    ChatConfig {
        user_id: user_id.to_string(),
        relay_url: relay_url.to_string(),
        api_url: None,
        access_token: None,
        key_store: KeyStoreBackend::Memory,
        db_path: PathBuf::from("unused.db"),
        request_timeout: Duration::from_secs(5),
        log: LogConfig::default(),
    }
}

/// Keys are published per connection; poll until the relay has `user_id`'s
async fn wait_for_key(handle: &ChatHandle, user_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(_)) = handle.relay.fetch_public_key(user_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Key for {} never became visible", user_id);
}

async fn next_inbound(handle: &mut ChatHandle) -> InboundOutcome {
    timeout(Duration::from_secs(5), handle.next_inbound())
        .await
        .expect("Timeout waiting for inbound message")
        .expect("Relay client dropped")
}

#[tokio::test]
async fn test_start_connects_and_publishes() {
    let relay_url = start_relay().await;
    let alice = start(&config(&relay_url, "alice")).await.unwrap();

    assert!(alice.relay.is_connected());
    wait_for_key(&alice, "alice").await;
}

#[tokio::test]
async fn test_conversation_over_relay() {
    let relay_url = start_relay().await;
    let mut alice = start(&config(&relay_url, "alice")).await.unwrap();
    let mut bob = start(&config(&relay_url, "bob")).await.unwrap();
    wait_for_key(&alice, "bob").await;
    wait_for_key(&bob, "alice").await;

    alice.session.open("bob").await.unwrap();
    bob.session.open("alice").await.unwrap();

    alice.session.send("hello").await.unwrap();
    assert_eq!(next_inbound(&mut bob).await, InboundOutcome::Displayed);

    let entry = &bob.session.transcript()[0];
    assert_eq!(entry.sender, "alice");
    assert_eq!(entry.body, MessageBody::Plaintext("hello".to_string()));

    bob.session.send("hi").await.unwrap();
    assert_eq!(next_inbound(&mut alice).await, InboundOutcome::Displayed);
    assert_eq!(alice.session.transcript()[1].body.display_text(), "hi");

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn test_offline_recipient_reads_history() {
    let relay_url = start_relay().await;
    let mut alice = start(&config(&relay_url, "alice")).await.unwrap();

    // Bob's key is on the relay but bob is offline
    let (bob_client, _bob_inbound) =
        WebSocketClient::new(&relay_url, "bob", None, Duration::from_secs(5));
    bob_client.connect().await.unwrap();
    bob_client
        .wait_until_connected(Duration::from_secs(5))
        .await
        .unwrap();
    let bob_key = infomundi_chat::crypto::LocalKeyPair::generate();
    bob_client
        .publish_public_key("bob", &bob_key.public_jwk())
        .await
        .unwrap();
    wait_for_key(&alice, "bob").await;

    alice.session.open("bob").await.unwrap();
    alice.session.send("are you there?").await.unwrap();
    alice.session.send("ping").await.unwrap();

    // Reopening replays the conversation from relay history
    alice.session.close();
    alice.session.open("bob").await.unwrap();
    let transcript = alice.session.transcript();
    assert_eq!(transcript.len(), 2);
    assert!(transcript
        .iter()
        .all(|entry| entry.delivery == DeliveryStatus::Sent));
    assert_eq!(transcript[1].body.display_text(), "ping");

    bob_client.disconnect();
    alice.shutdown();
}

#[tokio::test]
async fn test_unknown_peer_over_relay() {
    let relay_url = start_relay().await;
    let mut alice = start(&config(&relay_url, "alice")).await.unwrap();

    let err = alice.session.open("nobody").await.unwrap_err();
    assert!(matches!(err, ChatError::PeerKeyUnavailable(_)));
    assert!(!alice.session.is_composer_enabled());
}

#[tokio::test]
async fn test_start_tolerates_unreachable_relay() {
    // Nothing listens on this port once the listener is dropped
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut cfg = config(&format!("ws://127.0.0.1:{}", port), "alice");
    cfg.request_timeout = Duration::from_millis(200);

    let mut alice = start(&cfg).await.unwrap();
    assert!(!alice.relay.is_connected());

    let err = alice.session.open("bob").await.unwrap_err();
    assert!(matches!(err, ChatError::Transport(_)));
    alice.shutdown();
}
