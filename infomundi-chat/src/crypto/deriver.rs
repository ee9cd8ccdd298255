use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use super::types::{LocalKeyPair, PeerPublicKey, SessionKey};
use crate::error::{ChatError, ChatResult};

/// HKDF info label binding derived keys to this protocol
pub const SESSION_KEY_INFO: &[u8] = b"infomundi-chat/session/v1";

/// Derive the conversation key: P-256 ECDH, then HKDF-SHA256 to 32 bytes.
///
/// Deterministic and symmetric: both participants derive the same key from
/// their own private key and the other's public key. There is no key
/// confirmation step; a mismatch only shows up as decrypt failures.
pub fn derive_session_key(local: &LocalKeyPair, peer: &PeerPublicKey) -> ChatResult<SessionKey> {
   let shared_secret = p256::ecdh::diffie_hellman(
      local.secret_key().to_nonzero_scalar(),
      peer.key().as_affine(),
   );

   let hk = Hkdf::<Sha256>::new(None, shared_secret.raw_secret_bytes());
   let mut okm = [0u8; 32];
   hk.expand(SESSION_KEY_INFO, &mut okm)
      .map_err(|_| ChatError::KeyAgreement("HKDF expansion failed".to_string()))?;

   let session_key = SessionKey::from_bytes(okm);
   okm.zeroize();
   Ok(session_key)
}
