//! Wires storage, keys, relay and directory into a ready [`ChatSession`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{ChatConfig, KeyStoreBackend};
use crate::crypto::{KeyStorage, KeyStore, KeyringStorage, MemoryKeyStorage, SqliteKeyStorage};
use crate::db::Database;
use crate::error::ChatResult;
use crate::exchange::KeyExchange;
use crate::session::{ChatSession, InboundOutcome};
use crate::transport::{
    Directory, HttpDirectory, InboundCiphertext, MessageHistory, WebSocketClient,
};

/// A running chat client
pub struct ChatHandle {
    pub session: ChatSession,
    pub inbound: mpsc::UnboundedReceiver<InboundCiphertext>,
    pub relay: Arc<WebSocketClient>,
}

impl ChatHandle {
    /// Feed every ciphertext received so far into the session
    pub fn drain_inbound(&mut self) -> Vec<InboundOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(inbound) = self.inbound.try_recv() {
            outcomes.push(self.session.on_inbound(&inbound));
        }
        outcomes
    }

    /// Wait for the next ciphertext and route it; `None` once the relay client is gone
    pub async fn next_inbound(&mut self) -> Option<InboundOutcome> {
        let inbound = self.inbound.recv().await?;
        Some(self.session.on_inbound(&inbound))
    }

    pub fn shutdown(&mut self) {
        self.session.close();
        self.relay.disconnect();
    }
}

/// Build the key storage selected by `config.key_store`
pub fn open_key_storage(config: &ChatConfig) -> ChatResult<Arc<dyn KeyStorage>> {
    let storage: Arc<dyn KeyStorage> = match config.key_store {
        KeyStoreBackend::Keyring => Arc::new(KeyringStorage::new(&config.user_id)?),
        KeyStoreBackend::Sqlite => {
            let db = Arc::new(Database::open(&config.db_path)?);
            Arc::new(SqliteKeyStorage::new(db, &config.user_id))
        }
        KeyStoreBackend::Memory => Arc::new(MemoryKeyStorage::new()),
    };
    info!(backend = %config.key_store, "Key storage opened");
    Ok(storage)
}

/// Directory and history over HTTP when `api_url` is set, otherwise over the relay
fn lookup_services(
    config: &ChatConfig,
    relay: &Arc<WebSocketClient>,
) -> ChatResult<(Arc<dyn Directory>, Arc<dyn MessageHistory>)> {
    match &config.api_url {
        Some(api_url) => {
            let http = Arc::new(HttpDirectory::new(
                api_url,
                config.access_token.clone(),
                config.request_timeout,
            )?);
            let directory: Arc<dyn Directory> = http.clone();
            let history: Arc<dyn MessageHistory> = http;
            Ok((directory, history))
        }
        None => {
            let directory: Arc<dyn Directory> = relay.clone();
            let history: Arc<dyn MessageHistory> = relay.clone();
            Ok((directory, history))
        }
    }
}

/// Start chat for `config.user_id`.
///
/// Storage failures are returned and mean chat stays disabled. An offline
/// relay or a failed key publish is only logged; the relay client keeps
/// reconnecting and re-announces the key when it gets through.
pub async fn start(config: &ChatConfig) -> ChatResult<ChatHandle> {
    let storage = open_key_storage(config)?;
    let local = Arc::new(KeyStore::new(storage).ensure_local_key_pair()?);

    let (client, inbound) = WebSocketClient::new(
        &config.relay_url,
        &config.user_id,
        config.access_token.clone(),
        config.request_timeout,
    );
    let relay = Arc::new(client);
    relay.connect().await?;
    if let Err(e) = relay.wait_until_connected(config.request_timeout).await {
        warn!(
            url = %config.relay_url,
            error = %e,
            "Relay not reachable yet, retrying in background"
        );
    }

    let (directory, history) = lookup_services(config, &relay)?;

    let exchange = KeyExchange::new(&config.user_id, directory);
    if let Err(e) = exchange.publish_public_key(&local).await {
        warn!(error = %e, "Public key not published; peers cannot open a conversation yet");
    }

    let session = ChatSession::new(local, exchange, history, relay.clone());
    info!(
        user_id = %config.user_id,
        fingerprint = %session.local_fingerprint(),
        "Chat started"
    );

    Ok(ChatHandle {
        session,
        inbound,
        relay,
    })
}
