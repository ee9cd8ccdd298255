use keyring::Entry;
use rusqlite::OptionalExtension;
use std::sync::{Arc, Mutex};

use super::types::StoredKeyPair;
use crate::db::Database;
use crate::error::{ChatError, ChatResult};

const KEYRING_SERVICE: &str = "infomundi-chat";
const KEYRING_IDENTITY_PREFIX: &str = "identity-key-";

/// Durable storage for the serialized local key pair.
///
/// The pair is write-once: `store_if_absent` never replaces an existing pair
/// and returns whichever pair is persisted after the call.
pub trait KeyStorage: Send + Sync {
    fn load(&self) -> ChatResult<Option<StoredKeyPair>>;

    fn store_if_absent(&self, pair: &StoredKeyPair) -> ChatResult<StoredKeyPair>;

    /// Forget the stored pair (the next load generates a new identity)
    fn clear(&self) -> ChatResult<()>;
}

fn lock_poisoned<T>(_: T) -> ChatError {
    ChatError::StorageUnavailable("Key storage lock poisoned".to_string())
}

/// OS keyring (Windows Credential Manager, macOS Keychain, Linux Secret Service).
///
/// Keyrings have no atomic insert, so two processes generating a first key
/// at the same moment can each believe they won.
pub struct KeyringStorage {
    entry: Entry,
}

impl KeyringStorage {
    pub fn new(user_id: &str) -> ChatResult<Self> {
        let entry = Entry::new(
            KEYRING_SERVICE,
            &format!("{}{}", KEYRING_IDENTITY_PREFIX, user_id),
        )?;
        Ok(Self { entry })
    }
}

impl KeyStorage for KeyringStorage {
    fn load(&self) -> ChatResult<Option<StoredKeyPair>> {
        match self.entry.get_password() {
            Ok(json) => {
                let pair = serde_json::from_str(&json).map_err(|e| {
                    ChatError::StorageUnavailable(format!("Invalid key format in keyring: {}", e))
                })?;
                Ok(Some(pair))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_if_absent(&self, pair: &StoredKeyPair) -> ChatResult<StoredKeyPair> {
        if let Some(existing) = self.load()? {
            return Ok(existing);
        }
        let json = serde_json::to_string(pair)?;
        self.entry.set_password(&json)?;
        Ok(pair.clone())
    }

    fn clear(&self) -> ChatResult<()> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// SQLite-backed storage; the primary key makes first-generation atomic
pub struct SqliteKeyStorage {
    db: Arc<Database>,
    user_id: String,
}

impl SqliteKeyStorage {
    pub fn new(db: Arc<Database>, user_id: &str) -> Self {
        Self {
            db,
            user_id: user_id.to_string(),
        }
    }
}

impl KeyStorage for SqliteKeyStorage {
    fn load(&self) -> ChatResult<Option<StoredKeyPair>> {
        let conn = self.db.0.lock().map_err(lock_poisoned)?;
        let pair = conn
            .query_row(
                "SELECT public_jwk, private_jwk FROM identity_keys WHERE user_id = ?1",
                [&self.user_id],
                |row| {
                    Ok(StoredKeyPair {
                        public_jwk: row.get(0)?,
                        private_jwk: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(pair)
    }

    fn store_if_absent(&self, pair: &StoredKeyPair) -> ChatResult<StoredKeyPair> {
        {
            let conn = self.db.0.lock().map_err(lock_poisoned)?;
            let now = chrono::Utc::now().timestamp_millis();
            conn.execute(
                "INSERT OR IGNORE INTO identity_keys (user_id, public_jwk, private_jwk, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                (&self.user_id, &pair.public_jwk, &pair.private_jwk, now),
            )?;
        }

        self.load()?.ok_or_else(|| {
            ChatError::StorageUnavailable("Identity key vanished after insert".to_string())
        })
    }

    fn clear(&self) -> ChatResult<()> {
        let conn = self.db.0.lock().map_err(lock_poisoned)?;
        conn.execute(
            "DELETE FROM identity_keys WHERE user_id = ?1",
            [&self.user_id],
        )?;
        Ok(())
    }
}

/// Process-local storage for tests and throwaway identities
#[derive(Default)]
pub struct MemoryKeyStorage {
    slot: Mutex<Option<StoredKeyPair>>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn load(&self) -> ChatResult<Option<StoredKeyPair>> {
        Ok(self.slot.lock().map_err(lock_poisoned)?.clone())
    }

    fn store_if_absent(&self, pair: &StoredKeyPair) -> ChatResult<StoredKeyPair> {
        let mut slot = self.slot.lock().map_err(lock_poisoned)?;
        Ok(slot.get_or_insert_with(|| pair.clone()).clone())
    }

    fn clear(&self) -> ChatResult<()> {
        *self.slot.lock().map_err(lock_poisoned)? = None;
        Ok(())
    }
}
