use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
  #[error("encryption key is empty")]
  EmptyKey,
  #[error("token ciphertext is not valid base64: {0}")]
  Encoding(#[from] base64::DecodeError),
  #[error("token ciphertext is truncated")]
  Truncated,
  #[error("token encryption failed")]
  Encrypt,
  #[error("token decryption failed (wrong key or tampered ciphertext)")]
  Decrypt,
  #[error("decrypted token is not utf-8")]
  Utf8,
}

/// AES-256-GCM sealing of account credentials. Ciphertext layout is
/// `base64(nonce || ciphertext+tag)`.
#[derive(Clone)]
pub struct TokenCipher {
  cipher: Aes256Gcm,
}

impl TokenCipher {
  pub fn from_key_material(key_material: &str) -> Result<Self, CryptoError> {
    if key_material.trim().is_empty() {
      return Err(CryptoError::EmptyKey);
    }
    let digest = Sha256::digest(key_material.as_bytes());
    let key = Key::<Aes256Gcm>::from_slice(&digest);
    Ok(Self {
      cipher: Aes256Gcm::new(key),
    })
  }

  pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = self
      .cipher
      .encrypt(&nonce, plaintext.as_bytes())
      .map_err(|_| CryptoError::Encrypt)?;

    let mut combined = nonce.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(combined))
  }

  pub fn decrypt(&self, sealed: &str) -> Result<String, CryptoError> {
    let combined = STANDARD.decode(sealed.trim())?;
    if combined.len() <= NONCE_LEN {
      return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let plaintext = self
      .cipher
      .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
      .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sealed_token_opens_with_same_key() {
    let cipher = TokenCipher::from_key_material("k1").unwrap();
    let sealed = cipher.encrypt("act.abc123").unwrap();
    assert_ne!(sealed, "act.abc123");
    assert_eq!(cipher.decrypt(&sealed).unwrap(), "act.abc123");
  }

  #[test]
  fn nonces_differ_between_encryptions() {
    let cipher = TokenCipher::from_key_material("k1").unwrap();
    assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
  }

  #[test]
  fn wrong_key_fails_to_open() {
    let sealed = TokenCipher::from_key_material("k1").unwrap().encrypt("secret").unwrap();
    let other = TokenCipher::from_key_material("k2").unwrap();
    assert!(matches!(other.decrypt(&sealed), Err(CryptoError::Decrypt)));
  }

  #[test]
  fn rejects_legacy_plain_base64_and_garbage() {
    let cipher = TokenCipher::from_key_material("k1").unwrap();
    // A bare base64 encoding of a token is not accepted as a credential.
    assert!(cipher.decrypt(&STANDARD.encode("act.abc123")).is_err());
    assert!(matches!(cipher.decrypt("%%%"), Err(CryptoError::Encoding(_))));
    assert!(matches!(cipher.decrypt(&STANDARD.encode([1u8; 4])), Err(CryptoError::Truncated)));
  }

  #[test]
  fn empty_key_material_is_rejected() {
    assert!(matches!(TokenCipher::from_key_material("  "), Err(CryptoError::EmptyKey)));
  }
}
