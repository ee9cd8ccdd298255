//! End-to-end encrypted direct messages for Infomundi.
//!
//! Each user holds a long-term P-256 key pair. Two users derive a shared
//! AES-256-GCM key with ECDH and HKDF, and the relay only ever sees
//! ciphertext.

pub mod bootstrap;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod models;
pub mod session;
pub mod transport;

pub use bootstrap::{start, ChatHandle};
pub use config::{ChatConfig, KeyStoreBackend};
pub use error::{ChatError, ChatResult};
pub use exchange::KeyExchange;
pub use session::{ChatSession, ConversationLoader, InboundOutcome, OpenTicket, SessionState};
