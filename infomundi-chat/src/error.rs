//! Error types for the encrypted chat core.

use thiserror::Error;

/// Chat errors.
///
/// Every variant is recoverable at the application level: storage problems
/// disable chat, opening problems leave the session closed, decrypt problems
/// degrade a single message.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The local key pair cannot be read or persisted.
    #[error("Key storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The peer has never published a public key.
    #[error("No public key published for {0}")]
    PeerKeyUnavailable(String),

    /// Peer key material is malformed or on the wrong curve.
    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    /// Authentication tag mismatch or malformed ciphertext.
    #[error("Decryption failed: {0}")]
    DecryptFailure(String),

    /// Send/receive plumbing failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Input rejected by validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::StorageUnavailable(e.to_string())
    }
}

impl From<keyring::Error> for ChatError {
    fn from(e: keyring::Error) -> Self {
        ChatError::StorageUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(e.to_string())
    }
}
