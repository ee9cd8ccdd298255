use std::sync::Arc;
use tracing::{debug, info, warn};

use super::storage::KeyStorage;
use super::types::LocalKeyPair;
use crate::error::ChatResult;

/// Owns the local user's long-term key pair
pub struct KeyStore {
    storage: Arc<dyn KeyStorage>,
}

impl KeyStore {
    pub fn new(storage: Arc<dyn KeyStorage>) -> Self {
        Self { storage }
    }

    /// Return the persisted key pair, generating and persisting one on first use.
    ///
    /// Idempotent until storage is cleared externally. Any storage failure is
    /// `StorageUnavailable`, which callers treat as "chat disabled".
    pub fn ensure_local_key_pair(&self) -> ChatResult<LocalKeyPair> {
        if let Some(stored) = self.storage.load()? {
            let pair = LocalKeyPair::from_stored(&stored)?;
            debug!(fingerprint = %pair.fingerprint(), "Loaded identity key");
            return Ok(pair);
        }

        let generated = LocalKeyPair::generate();
        let persisted = self.storage.store_if_absent(&generated.to_stored())?;
        let pair = LocalKeyPair::from_stored(&persisted)?;

        if pair.public_key() == generated.public_key() {
            info!(fingerprint = %pair.fingerprint(), "Generated new identity key");
        } else {
            warn!(
                fingerprint = %pair.fingerprint(),
                "Identity key was generated concurrently elsewhere, using the persisted one"
            );
        }

        Ok(pair)
    }
}
