use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

use crate::messages::HistoryEntry;

/// Maximum stored ciphertexts per conversation to prevent unbounded memory growth
pub const MAX_HISTORY_PER_CONVERSATION: usize = 1000;

/// Relay state: connected clients, published public keys and ciphertext history
pub struct ServerState {
    /// user_id -> list of sender channels (supports multiple connections per user)
    pub clients: DashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    /// user_id -> published public key (JWK)
    public_keys: DashMap<String, String>,
    /// conversation key -> opaque ciphertexts in arrival order
    history: DashMap<(String, String), Vec<HistoryEntry>>,
}

/// Order-independent key for the conversation between two users
fn conversation_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            public_keys: DashMap::new(),
            history: DashMap::new(),
        }
    }

    /// Register a new client connection (supports multiple connections per user)
    pub fn add_client(&self, user_id: String, tx: mpsc::UnboundedSender<String>) {
        self.clients.entry(user_id).or_default().push(tx);
    }

    /// Remove one connection (and any closed ones) for a user.
    ///
    /// The entry is dropped once no connection remains.
    pub fn remove_client(&self, user_id: &str, conn: &mpsc::UnboundedSender<String>) {
        if let Some(mut entry) = self.clients.get_mut(user_id) {
            entry.retain(|tx| !tx.same_channel(conn) && !tx.is_closed());
            if entry.is_empty() {
                drop(entry);
                self.clients.remove(user_id);
            }
        }
    }

    /// Broadcast message to all clients except the sender
    pub fn broadcast(&self, message: &str, exclude_user_id: Option<&str>) {
        for entry in self.clients.iter() {
            if Some(entry.key().as_str()) != exclude_user_id {
                for tx in entry.value().iter() {
                    let _ = tx.send(message.to_string());
                }
            }
        }
    }

    /// Send message to a specific user (sends to all their connections)
    pub fn send_to_user(&self, user_id: &str, message: &str) -> bool {
        if let Some(channels) = self.clients.get(user_id) {
            let mut sent = false;
            for tx in channels.iter() {
                if tx.send(message.to_string()).is_ok() {
                    sent = true;
                }
            }
            sent
        } else {
            false
        }
    }

    /// Upsert a user's public key
    pub fn publish_key(&self, user_id: &str, public_key: String) {
        let replaced = self
            .public_keys
            .insert(user_id.to_string(), public_key)
            .is_some();
        info!(user_id, replaced, "Public key published");
    }

    /// Look up a user's public key
    pub fn public_key(&self, user_id: &str) -> Option<String> {
        self.public_keys.get(user_id).map(|k| k.value().clone())
    }

    /// Append a ciphertext to the conversation between `from` and `to`
    pub fn record_message(&self, from: &str, to: &str, ciphertext: String, timestamp: i64) {
        let mut entry = self.history.entry(conversation_key(from, to)).or_default();

        // Enforce history limit - drop oldest if at capacity
        if entry.len() >= MAX_HISTORY_PER_CONVERSATION {
            entry.remove(0);
            info!(from, to, "History limit reached, dropped oldest message");
        }
        entry.push(HistoryEntry {
            from: from.to_string(),
            ciphertext,
            timestamp,
        });
    }

    /// Stored ciphertexts between two users, oldest first
    pub fn history(&self, user_id: &str, peer_id: &str) -> Vec<HistoryEntry> {
        self.history
            .get(&conversation_key(user_id, peer_id))
            .map(|msgs| msgs.value().clone())
            .unwrap_or_default()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}
