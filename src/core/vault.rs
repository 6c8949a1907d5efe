//! Credential vault: AES-256-GCM over stored school credentials.
//!
//! The key is a fixed 32-byte provisioned secret loaded once at startup by
//! [`crate::config::Config::from_env`]; if it cannot be loaded the process
//! refuses to start. Plaintext only ever exists transiently inside the
//! executor's login step and is never persisted or logged.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Result;
use base64::Engine;

pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key is valid for AES-256");
        Self { cipher }
    }

    /// Encrypt a plaintext value. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a base64(nonce || ciphertext) value. Returns plaintext.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("Base64 decode failed: {}", e))?;

        if combined.len() < 13 {
            return Err(anyhow::anyhow!("Encrypted value too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("UTF-8 decode failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> CredentialVault {
        CredentialVault::new(&[7u8; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let vault = test_vault();
        let plaintext = "school-password-12345";
        let encrypted = vault.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        let decrypted = vault.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn encrypt_produces_different_ciphertext_each_time() {
        let vault = test_vault();
        let plaintext = "same-input";
        let a = vault.encrypt(plaintext).unwrap();
        let b = vault.encrypt(plaintext).unwrap();
        assert_ne!(a, b, "random nonce should produce different ciphertext");
        assert_eq!(vault.decrypt(&a).unwrap(), plaintext);
        assert_eq!(vault.decrypt(&b).unwrap(), plaintext);
    }

    #[test]
    fn decrypt_rejects_short_input() {
        let vault = test_vault();
        let short = base64::engine::general_purpose::STANDARD.encode(b"short");
        assert!(vault.decrypt(&short).is_err());
    }

    #[test]
    fn decrypt_rejects_invalid_base64() {
        let vault = test_vault();
        assert!(vault.decrypt("not-valid-base64!!!").is_err());
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let vault = test_vault();
        let other = CredentialVault::new(&[8u8; 32]);
        let encrypted = vault.encrypt("secret").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn handles_empty_and_unicode_values() {
        let vault = test_vault();
        let empty = vault.encrypt("").unwrap();
        assert_eq!(vault.decrypt(&empty).unwrap(), "");
        let unicode = vault.encrypt("пароль🔑").unwrap();
        assert_eq!(vault.decrypt(&unicode).unwrap(), "пароль🔑");
    }
}
