use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;

use crate::error::{PipelineError, PipelineResult};

const CIPHERTEXT_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for OAuth tokens at rest.
///
/// Stored form is `v1:` followed by base64 of `nonce || ciphertext`. The key is process-wide
/// configuration; tenants never supply it.
#[derive(Clone)]
pub struct TokenCipher {
  cipher: Aes256Gcm,
}

impl TokenCipher {
  pub fn from_key(key: &[u8; 32]) -> PipelineResult<Self> {
    let cipher =
      Aes256Gcm::new_from_slice(key).map_err(|error| PipelineError::Config(error.to_string()))?;
    Ok(Self { cipher })
  }

  pub fn from_base64_key(encoded: &str) -> PipelineResult<Self> {
    let decoded = base64::engine::general_purpose::STANDARD
      .decode(encoded.trim())
      .map_err(|error| PipelineError::Config(format!("invalid encryption key: {error}")))?;
    if decoded.len() != 32 {
      return Err(PipelineError::Config(format!(
        "encryption key must be 32 bytes, got {}",
        decoded.len()
      )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&decoded);
    Self::from_key(&key)
  }

  pub fn encrypt(&self, plaintext: &str) -> PipelineResult<String> {
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let encrypted = self
      .cipher
      .encrypt(nonce, plaintext.as_bytes())
      .map_err(|error| PipelineError::Storage(format!("token encryption failed: {error}")))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + encrypted.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&encrypted);
    Ok(format!(
      "{CIPHERTEXT_PREFIX}{}",
      base64::engine::general_purpose::STANDARD.encode(sealed)
    ))
  }

  pub fn decrypt(&self, stored: &str) -> PipelineResult<String> {
    let encoded = stored
      .strip_prefix(CIPHERTEXT_PREFIX)
      .ok_or_else(|| PipelineError::Storage("unsupported token ciphertext version".to_string()))?;
    let sealed = base64::engine::general_purpose::STANDARD
      .decode(encoded)
      .map_err(|error| PipelineError::Storage(format!("corrupt token ciphertext: {error}")))?;
    if sealed.len() <= NONCE_LEN {
      return Err(PipelineError::Storage("corrupt token ciphertext: too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let plaintext = self
      .cipher
      .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
      .map_err(|_| PipelineError::Storage("token ciphertext failed authentication".to_string()))?;
    String::from_utf8(plaintext)
      .map_err(|error| PipelineError::Storage(format!("token is not utf-8: {error}")))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cipher() -> TokenCipher {
    TokenCipher::from_key(&[7u8; 32]).unwrap()
  }

  #[test]
  fn sealed_tokens_do_not_contain_plaintext() {
    let sealed = cipher().encrypt("ya29.secret-token").unwrap();
    assert!(sealed.starts_with("v1:"));
    assert!(!sealed.contains("secret-token"));
    assert_eq!(cipher().decrypt(&sealed).unwrap(), "ya29.secret-token");
  }

  #[test]
  fn tampered_ciphertext_is_rejected() {
    let sealed = cipher().encrypt("token").unwrap();
    let mut raw = base64::engine::general_purpose::STANDARD
      .decode(sealed.trim_start_matches("v1:"))
      .unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    let tampered = format!("v1:{}", base64::engine::general_purpose::STANDARD.encode(raw));
    assert!(cipher().decrypt(&tampered).is_err());
  }

  #[test]
  fn wrong_key_cannot_decrypt() {
    let sealed = cipher().encrypt("token").unwrap();
    let other = TokenCipher::from_key(&[9u8; 32]).unwrap();
    assert!(other.decrypt(&sealed).is_err());
  }

  #[test]
  fn rejects_short_base64_key() {
    let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
    assert!(matches!(
      TokenCipher::from_base64_key(&short),
      Err(PipelineError::Config(_))
    ));
  }
}
