use serde::{Deserialize, Serialize};

/// A stored ciphertext as returned in history responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: String,
    pub ciphertext: String,
    pub timestamp: i64,
}

/// WebSocket message types (shared between relay and client)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "connect")]
    Connect {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "auth_response")]
    AuthResponse { success: bool, message: String },
    #[serde(rename = "send_message")]
    SendMessage { to: String, message: String },
    #[serde(rename = "receive_message")]
    ReceiveMessage {
        from: String,
        message: String,
        timestamp: i64,
    },
    #[serde(rename = "publish_key")]
    PublishKey { user_id: String, public_key: String },
    #[serde(rename = "key_request")]
    KeyRequest { request_id: String, user_id: String },
    #[serde(rename = "key_response")]
    KeyResponse {
        request_id: String,
        user_id: String,
        public_key: Option<String>,
    },
    #[serde(rename = "history_request")]
    HistoryRequest { request_id: String, peer_id: String },
    #[serde(rename = "history_response")]
    HistoryResponse {
        request_id: String,
        messages: Vec<HistoryEntry>,
    },
    #[serde(rename = "presence")]
    Presence {
        user_id: String,
        is_online: bool,
        last_seen: Option<i64>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
}
