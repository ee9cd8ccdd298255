//! Key lifecycle, session key derivation and message encryption.

pub mod cipher;
mod deriver;
mod keystore;
mod storage;
mod types;

pub use deriver::{derive_session_key, SESSION_KEY_INFO};
pub use keystore::KeyStore;
pub use storage::{KeyStorage, KeyringStorage, MemoryKeyStorage, SqliteKeyStorage};
pub use types::{
    fingerprint, EncryptedMessage, LocalKeyPair, PeerPublicKey, SessionKey, StoredKeyPair,
};
