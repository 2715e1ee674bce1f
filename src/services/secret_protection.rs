//! At-rest protection for credentials stored in provider configuration.
//!
//! Protected values look like `enc:v1:<base64(nonce || ciphertext || tag)>`
//! and are sealed with XChaCha20-Poly1305. Anything without the prefix is
//! treated as a legacy plaintext value and passed through unchanged.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::storage::{StorageError, StorageResult};

pub const PROTECTED_PREFIX: &str = "enc:v1:";
pub const KEY_LENGTH: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

pub fn is_protected(value: &str) -> bool {
    value.starts_with(PROTECTED_PREFIX)
}

pub struct SecretProtector {
    key: Zeroizing<[u8; KEY_LENGTH]>,
}

impl std::fmt::Debug for SecretProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretProtector").field("key", &"***").finish()
    }
}

impl SecretProtector {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self { key: Zeroizing::new(key) }
    }

    /// Build from a base64 encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> StorageResult<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| StorageError::Validation(format!("Storage secret key is not valid base64: {}", e)))?,
        );
        if decoded.len() != KEY_LENGTH {
            return Err(StorageError::Validation(format!(
                "Storage secret key must be {} bytes, got {}",
                KEY_LENGTH,
                decoded.len()
            )));
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&decoded);
        Ok(Self::new(key))
    }

    /// A fresh random key, base64 encoded.
    pub fn generate_key() -> String {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        STANDARD.encode(key)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(GenericArray::from_slice(&self.key[..]))
    }

    pub fn protect(&self, plaintext: &str) -> StorageResult<String> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| StorageError::Internal(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", PROTECTED_PREFIX, STANDARD.encode(sealed)))
    }

    /// Reveal a protected value; plaintext values come back as they are.
    pub fn unprotect(&self, value: &str) -> StorageResult<String> {
        let Some(encoded) = value.strip_prefix(PROTECTED_PREFIX) else {
            return Ok(value.to_string());
        };

        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| StorageError::Validation(format!("Protected value is not valid base64: {}", e)))?;
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StorageError::Validation("Protected value is too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(GenericArray::from_slice(nonce), ciphertext)
                .map_err(|_| {
                    StorageError::Validation("Protected value could not be decrypted with the configured key".to_string())
                })?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| StorageError::Validation("Protected value is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protector() -> SecretProtector {
        SecretProtector::from_base64_key(&SecretProtector::generate_key()).unwrap()
    }

    #[test]
    fn test_protect_then_unprotect() {
        let protector = protector();
        let sealed = protector.protect("hunter2").unwrap();

        assert!(is_protected(&sealed));
        assert!(!sealed.contains("hunter2"));
        assert_eq!(protector.unprotect(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn test_nonces_differ() {
        let protector = protector();
        assert_ne!(protector.protect("same").unwrap(), protector.protect("same").unwrap());
    }

    #[test]
    fn test_plaintext_passes_through() {
        assert_eq!(protector().unprotect("legacy-password").unwrap(), "legacy-password");
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sealed = protector().protect("secret").unwrap();
        assert!(matches!(protector().unprotect(&sealed), Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_tampered_value_is_rejected() {
        let protector = protector();
        let sealed = protector.protect("secret").unwrap();
        let mut bytes = STANDARD.decode(sealed.strip_prefix(PROTECTED_PREFIX).unwrap()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = format!("{}{}", PROTECTED_PREFIX, STANDARD.encode(bytes));

        assert!(protector.unprotect(&tampered).is_err());
    }

    #[test]
    fn test_key_length_is_checked() {
        assert!(SecretProtector::from_base64_key(&STANDARD.encode([0u8; 16])).is_err());
        assert!(SecretProtector::from_base64_key("not base64!").is_err());
    }
}
