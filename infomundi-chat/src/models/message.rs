use serde::{Deserialize, Serialize};

/// Shown in place of any message that fails authentication
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[Encrypted message - unable to decrypt]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum MessageBody {
   Plaintext(String),
   Undecryptable,
}

impl MessageBody {
   /// Text safe to render; never the raw ciphertext
   pub fn display_text(&self) -> &str {
      match self {
         MessageBody::Plaintext(text) => text,
         MessageBody::Undecryptable => UNDECRYPTABLE_PLACEHOLDER,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
   Received,
   Sent,
   /// Handed to the transport, which reported a failure
   Failed,
}

/// One line of the visible conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
   pub sender: String,
   pub timestamp: i64,
   pub body: MessageBody,
   pub delivery: DeliveryStatus,
}

/// Ciphertext for a peer that is not the active conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
   pub from: String,
   pub received_at: i64,
}
