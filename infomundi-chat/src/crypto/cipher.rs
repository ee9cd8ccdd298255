use aes_gcm::{
   aead::{Aead, KeyInit},
   Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use super::types::SessionKey;
use crate::error::{ChatError, ChatResult};

/// AES-GCM nonce length (96 bits)
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length
pub const TAG_LEN: usize = 16;

fn cipher_for(key: &SessionKey) -> Aes256Gcm {
   Aes256Gcm::new(key.as_bytes().into())
}

/// Encrypt with a fresh random nonce; returns base64(nonce || ciphertext || tag)
pub fn encrypt(key: &SessionKey, plaintext: &str) -> ChatResult<String> {
   // Fresh nonce on every call; a nonce must never repeat under one key
   let mut nonce_bytes = [0u8; NONCE_LEN];
   rand::thread_rng().fill_bytes(&mut nonce_bytes);
   let nonce = Nonce::from_slice(&nonce_bytes);

   let ciphertext = cipher_for(key)
      .encrypt(nonce, plaintext.as_bytes())
      .map_err(|_| ChatError::InvalidInput("Message could not be encrypted".to_string()))?;

   let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
   payload.extend_from_slice(&nonce_bytes);
   payload.extend_from_slice(&ciphertext);

   Ok(BASE64.encode(payload))
}

/// Decrypt a payload produced by [`encrypt`].
///
/// Any malformed or tampered input yields `DecryptFailure`; partial plaintext
/// is never returned.
pub fn decrypt(key: &SessionKey, encoded: &str) -> ChatResult<String> {
   let payload = BASE64
      .decode(encoded)
      .map_err(|_| ChatError::DecryptFailure("Payload is not valid base64".to_string()))?;

   if payload.len() < NONCE_LEN + TAG_LEN {
      return Err(ChatError::DecryptFailure(format!(
         "Payload too short ({} bytes)",
         payload.len()
      )));
   }

   let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
   let plaintext = cipher_for(key)
      .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
      .map_err(|_| {
         ChatError::DecryptFailure("Authentication failed - message may be tampered".to_string())
      })?;

   String::from_utf8(plaintext)
      .map_err(|_| ChatError::DecryptFailure("Invalid UTF-8 in decrypted message".to_string()))
}
