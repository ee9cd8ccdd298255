use std::fmt;

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ChatError, ChatResult};

/// Serialized key pair for storage: both halves as JWK strings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredKeyPair {
    pub public_jwk: String,
    pub private_jwk: String,
}

impl fmt::Debug for StoredKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKeyPair")
            .field("public_jwk", &self.public_jwk)
            .field("private_jwk", &"<redacted>")
            .finish()
    }
}

/// Long-term P-256 key pair of the local user, used only for key agreement
pub struct LocalKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl LocalKeyPair {
    /// Generate a fresh key pair from the OS CSPRNG
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Rebuild a key pair from storage, checking that both halves belong together
    pub fn from_stored(stored: &StoredKeyPair) -> ChatResult<Self> {
        let secret = SecretKey::from_jwk_str(&stored.private_jwk).map_err(|_| {
            ChatError::StorageUnavailable("Invalid private key format in storage".to_string())
        })?;
        let public = PublicKey::from_jwk_str(&stored.public_jwk).map_err(|_| {
            ChatError::StorageUnavailable("Invalid public key format in storage".to_string())
        })?;

        if secret.public_key() != public {
            return Err(ChatError::StorageUnavailable(
                "Stored public key does not match private key".to_string(),
            ));
        }

        Ok(Self { secret, public })
    }

    pub fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            public_jwk: self.public_jwk(),
            private_jwk: self.secret.to_jwk_string().to_string(),
        }
    }

    /// Public half in the exchange format sent to the directory
    pub fn public_jwk(&self) -> String {
        self.public.to_jwk_string()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public)
    }
}

impl fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Hex SHA-256 of the compressed SEC1 point
pub fn fingerprint(key: &PublicKey) -> String {
    let point = key.to_encoded_point(true);
    hex::encode(Sha256::digest(point.as_bytes()))
}

/// A peer's public key as fetched from the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPublicKey {
    pub peer_id: String,
    key: PublicKey,
}

impl PeerPublicKey {
    /// Parse a JWK, rejecting anything that is not a valid P-256 point
    pub fn from_jwk(peer_id: &str, jwk: &str) -> ChatResult<Self> {
        let key = PublicKey::from_jwk_str(jwk).map_err(|_| {
            ChatError::KeyAgreement(format!("Invalid P-256 public key for {}", peer_id))
        })?;
        Ok(Self {
            peer_id: peer_id.to_string(),
            key,
        })
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }
}

/// Symmetric AES-256-GCM key for one conversation. Memory only.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Ciphertext plus routing metadata, as stored in history and relayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// base64(nonce || ciphertext || tag)
    pub ciphertext: String,
    pub sender: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_round_trip_preserves_key() {
        let pair = LocalKeyPair::generate();
        let restored = LocalKeyPair::from_stored(&pair.to_stored()).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
        assert_eq!(restored.to_stored(), pair.to_stored());
    }

    #[test]
    fn test_mismatched_halves_rejected() {
        let a = LocalKeyPair::generate().to_stored();
        let b = LocalKeyPair::generate().to_stored();
        let mixed = StoredKeyPair {
            public_jwk: a.public_jwk.clone(),
            private_jwk: b.private_jwk.clone(),
        };

        let err = LocalKeyPair::from_stored(&mixed).unwrap_err();
        assert!(matches!(err, ChatError::StorageUnavailable(_)));
    }

    #[test]
    fn test_public_jwk_is_p256() {
        let pair = LocalKeyPair::generate();
        let jwk: serde_json::Value = serde_json::from_str(&pair.public_jwk()).unwrap();
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
        assert!(jwk.get("d").is_none(), "Public JWK must not carry the private scalar");
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let pair = LocalKeyPair::generate();
        let stored = pair.to_stored();
        let d = serde_json::from_str::<serde_json::Value>(&stored.private_jwk).unwrap()["d"]
            .as_str()
            .unwrap()
            .to_string();

        assert!(!format!("{:?}", stored).contains(&d));
        assert!(!format!("{:?}", pair).contains(&d));
        assert_eq!(
            format!("{:?}", SessionKey::from_bytes([7u8; 32])),
            "SessionKey(<redacted>)"
        );
    }

    #[test]
    fn test_peer_key_rejects_other_curves() {
        // Valid P-384 JWK (generator point)
        let p384 = r#"{"kty":"EC","crv":"P-384","x":"qofKIr6LBTeOscce8yCtdG4dO2KLp5uYWfdB4IJUKjhVAvJdv1UpbDpUXjhydgq3","y":"NhfeSpYmLG9dnpi_kpLcKfj_bZCcq3YqfI2_AomwJX44Ii3d-_2fMZKN05xy4LqB"}"#;
        let err = PeerPublicKey::from_jwk("bob", p384).unwrap_err();
        assert!(matches!(err, ChatError::KeyAgreement(_)));
    }

    #[test]
    fn test_peer_key_rejects_garbage() {
        let err = PeerPublicKey::from_jwk("bob", "not a jwk").unwrap_err();
        assert!(matches!(err, ChatError::KeyAgreement(_)));

        let off_curve = r#"{"kty":"EC","crv":"P-256","x":"AQ","y":"AQ"}"#;
        assert!(PeerPublicKey::from_jwk("bob", off_curve).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let pair = LocalKeyPair::generate();
        let peer = PeerPublicKey::from_jwk("me", &pair.public_jwk()).unwrap();
        assert_eq!(pair.fingerprint(), peer.fingerprint());
        assert_eq!(pair.fingerprint().len(), 64);
    }
}
