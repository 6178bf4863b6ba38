//! Encryption collaborator for stored credential payloads.
//!
//! The engine only ever calls [`CredentialCipher::decrypt`]; how payloads are
//! sealed at rest is the cipher's business. [`XChaChaCipher`] is the bundled
//! implementation used by the CLI.
//!
//! Wire format (base64, standard alphabet): `nonce (24 bytes) || ciphertext || tag (16 bytes)`

use crate::CredentialError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Encrypts and decrypts opaque credential payloads.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CredentialError>;

    /// Fails with [`CredentialError::Decryption`] on key mismatch or tampering.
    fn decrypt(&self, opaque: &str) -> Result<Vec<u8>, CredentialError>;
}

/// XChaCha20-Poly1305 authenticated encryption with a random nonce per payload.
pub struct XChaChaCipher {
    cipher: XChaCha20Poly1305,
}

impl XChaChaCipher {
    /// Build from a base64-encoded 32 byte key.
    pub fn from_base64(key: &str) -> Result<Self, CredentialError> {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| CredentialError::Encryption(format!("invalid key encoding: {e}")))?;
        if bytes.len() != 32 {
            return Err(CredentialError::Encryption(format!(
                "key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = Key::from_slice(&bytes);
        Ok(Self {
            cipher: XChaCha20Poly1305::new(key),
        })
    }

    /// Generate a fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        STANDARD.encode(key)
    }
}

impl CredentialCipher for XChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CredentialError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CredentialError::Encryption("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn decrypt(&self, opaque: &str) -> Result<Vec<u8>, CredentialError> {
        let sealed = STANDARD
            .decode(opaque.trim())
            .map_err(|e| CredentialError::Decryption(format!("invalid encoding: {e}")))?;
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CredentialError::Decryption("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decryption("key mismatch or tampered payload".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypts_what_it_encrypted() {
        let cipher = XChaChaCipher::from_base64(&XChaChaCipher::generate_key()).unwrap();
        let sealed = cipher.encrypt(br#"{"token":"abc"}"#).unwrap();
        assert_eq!(cipher.decrypt(&sealed).unwrap(), br#"{"token":"abc"}"#.to_vec());
    }

    #[test]
    fn rejects_wrong_key_and_tampering() {
        let cipher = XChaChaCipher::from_base64(&XChaChaCipher::generate_key()).unwrap();
        let other = XChaChaCipher::from_base64(&XChaChaCipher::generate_key()).unwrap();
        let sealed = cipher.encrypt(b"secret").unwrap();

        assert!(matches!(other.decrypt(&sealed), Err(CredentialError::Decryption(_))));

        let mut bytes = STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = STANDARD.encode(bytes);
        assert!(matches!(cipher.decrypt(&tampered), Err(CredentialError::Decryption(_))));
    }

    #[test]
    fn rejects_short_keys() {
        let key = STANDARD.encode([7u8; 16]);
        assert!(XChaChaCipher::from_base64(&key).is_err());
    }
}
