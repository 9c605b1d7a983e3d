//! Encryption at rest for cached certificate material
//!
//! Values are encrypted with AES-256 in CFB mode. The stored layout is the
//! 16 byte IV followed by the ciphertext, so the ciphertext is exactly one
//! block longer than the plaintext.

use super::CacheError;
use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of encryption key in bytes (256 bits)
const KEY_LENGTH: usize = 32;
/// Length of the IV prefix in bytes (one AES block)
pub const IV_LENGTH: usize = 16;
/// PBKDF2 iteration count used when deriving the key from a passphrase
const PBKDF2_ROUNDS: u32 = 1048;

type Encryptor = cfb_mode::Encryptor<Aes256>;
type Decryptor = cfb_mode::Decryptor<Aes256>;

/// Symmetric key used by the certificate cache
#[derive(Clone)]
pub struct EncryptionKey {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl EncryptionKey {
    /// Derive a key from an operator supplied passphrase.
    ///
    /// Returns `None` for an empty passphrase, which disables encryption.
    pub fn from_passphrase(passphrase: &str) -> Option<Self> {
        if passphrase.is_empty() {
            return None;
        }

        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_LENGTH];
        pbkdf2::pbkdf2_hmac::<Sha256>(&digest[..15], &digest[16..32], PBKDF2_ROUNDS, &mut key);

        Some(Self { key })
    }

    /// Encrypt `plaintext` under a fresh random IV
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CacheError> {
        let mut out = vec![0u8; IV_LENGTH + plaintext.len()];
        let (iv, payload) = out.split_at_mut(IV_LENGTH);
        OsRng.fill_bytes(iv);
        payload.copy_from_slice(plaintext);

        let cipher = Encryptor::new_from_slices(&self.key, iv)
            .map_err(|e| CacheError::Crypto(e.to_string()))?;
        cipher.encrypt(payload);

        Ok(out)
    }

    /// Decrypt a value produced by [`EncryptionKey::encrypt`]
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        if data.len() < IV_LENGTH {
            return Err(CacheError::Corrupted(format!(
                "ciphertext is {} bytes, shorter than one block",
                data.len()
            )));
        }

        let (iv, payload) = data.split_at(IV_LENGTH);
        let mut plaintext = payload.to_vec();
        let cipher = Decryptor::new_from_slices(&self.key, iv)
            .map_err(|e| CacheError::Crypto(e.to_string()))?;
        cipher.decrypt(&mut plaintext);

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_passphrase_disables_encryption() {
        assert!(EncryptionKey::from_passphrase("").is_none());
        assert!(EncryptionKey::from_passphrase("secret").is_some());
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let a = EncryptionKey::from_passphrase("correct horse").unwrap();
        let b = EncryptionKey::from_passphrase("correct horse").unwrap();
        let c = EncryptionKey::from_passphrase("battery staple").unwrap();

        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = EncryptionKey::from_passphrase("secret").unwrap();
        let plaintext = b"-----BEGIN CERTIFICATE-----";

        let ciphertext = key.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + IV_LENGTH);
        assert_ne!(&ciphertext[IV_LENGTH..], &plaintext[..]);

        let decrypted = key.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let key = EncryptionKey::from_passphrase("secret").unwrap();
        let first = key.encrypt(b"same input").unwrap();
        let second = key.encrypt(b"same input").unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_short_ciphertext_is_corrupted() {
        let key = EncryptionKey::from_passphrase("secret").unwrap();
        let err = key.decrypt(&[0u8; 8]).unwrap_err();

        assert!(matches!(err, CacheError::Corrupted(_)));
    }

    #[test]
    fn test_wrong_key_does_not_recover_plaintext() {
        let key = EncryptionKey::from_passphrase("secret").unwrap();
        let other = EncryptionKey::from_passphrase("other").unwrap();

        let ciphertext = key.encrypt(b"private key material").unwrap();
        let garbage = other.decrypt(&ciphertext).unwrap();
        assert_ne!(garbage, b"private key material");
    }
}
