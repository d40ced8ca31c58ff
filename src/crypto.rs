//! Hashing and authenticated encryption for shares and metadata chunks
//!
//! Two strength profiles are supported: HIGH (AES-256-GCM + SHA-256) and
//! LOW (AES-128-GCM + SHA-1). Fingerprints always occupy 32 bytes; the
//! LOW profile zero-pads its 20-byte digests. Encryption keys are derived
//! from content, so nonces are derived from the key instead of drawn at
//! random: identical plaintext must yield identical ciphertext for
//! metadata chunks to deduplicate.

use crate::config::SecurityProfile;
use crate::{EngineError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Key, Nonce};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Fingerprint width, fixed across profiles
pub const FP_SIZE: usize = 32;

/// Key material width, fixed across profiles
pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;

/// Encryption key wrapper with secure handling
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Create a new encryption key
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Profile-parameterized hash and cipher engine
#[derive(Debug, Clone, Copy)]
pub struct CryptoEngine {
    profile: SecurityProfile,
}

impl CryptoEngine {
    /// Create an engine for the given profile
    pub fn new(profile: SecurityProfile) -> Self {
        Self { profile }
    }

    /// Compute the 32-byte fingerprint of a byte slice
    pub fn fingerprint(&self, data: &[u8]) -> [u8; FP_SIZE] {
        let mut out = [0u8; FP_SIZE];
        match self.profile {
            SecurityProfile::High => {
                out.copy_from_slice(&Sha256::digest(data));
            }
            SecurityProfile::Low => {
                let digest = Sha1::digest(data);
                out[..digest.len()].copy_from_slice(&digest);
            }
        }
        out
    }

    /// Derive a convergent encryption key from content
    pub fn derive_key(&self, content: &[u8]) -> EncryptionKey {
        EncryptionKey::new(self.fingerprint(content))
    }

    /// Derive the key-recipe key from an out-of-band passphrase
    pub fn passphrase_key(&self, passphrase: &str) -> EncryptionKey {
        let mut hasher = Sha256::new();
        hasher.update(b"scatterstore-keyrecipe-v1");
        hasher.update(passphrase.as_bytes());
        EncryptionKey::new(hasher.finalize().into())
    }

    /// Nonce derived from the key. Each key encrypts exactly one message,
    /// so a fixed key-to-nonce mapping cannot repeat across plaintexts.
    fn nonce_for(&self, key: &EncryptionKey) -> [u8; NONCE_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(b"scatterstore-nonce-v1");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        nonce
    }

    /// Encrypt data under the given key
    pub fn encrypt(&self, data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
        let nonce = self.nonce_for(key);
        self.encrypt_with_nonce(data, key, &nonce)
    }

    fn encrypt_with_nonce(
        &self,
        data: &[u8],
        key: &EncryptionKey,
        nonce_bytes: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce_bytes);
        match self.profile {
            SecurityProfile::High => {
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
                cipher
                    .encrypt(nonce, data)
                    .map_err(|_| EngineError::Crypto("encryption failed".into()))
            }
            SecurityProfile::Low => {
                let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key.as_bytes()[..16]));
                cipher
                    .encrypt(nonce, data)
                    .map_err(|_| EngineError::Crypto("encryption failed".into()))
            }
        }
    }

    /// Encrypt under a long-lived key such as the passphrase key. The
    /// nonce is derived from key and plaintext together, so one key can
    /// seal many distinct messages; it travels as a prefix of the output.
    pub fn seal(&self, data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(b"scatterstore-seal-nonce-v1");
        hasher.update(key.as_bytes());
        hasher.update(data);
        let digest = hasher.finalize();
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);

        let ct = self.encrypt_with_nonce(data, key, &nonce)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Reverse of [`CryptoEngine::seal`]
    pub fn open(&self, sealed: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(EngineError::Crypto(
                "sealed data too short to carry a nonce".into(),
            ));
        }
        let (nonce_bytes, ct) = sealed.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        self.decrypt_with_nonce(ct, key, &nonce)
    }

    /// Decrypt data under the given key
    pub fn decrypt(&self, ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
        let nonce = self.nonce_for(key);
        self.decrypt_with_nonce(ciphertext, key, &nonce)
    }

    fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        key: &EncryptionKey,
        nonce_bytes: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce_bytes);
        match self.profile {
            SecurityProfile::High => {
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
                cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| EngineError::Crypto("decryption failed".into()))
            }
            SecurityProfile::Low => {
                let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key.as_bytes()[..16]));
                cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| EngineError::Crypto("decryption failed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_roundtrip_both_profiles() {
        for profile in [SecurityProfile::High, SecurityProfile::Low] {
            let engine = CryptoEngine::new(profile);
            let data = b"the quick brown fox";
            let key = engine.derive_key(data);

            let encrypted = engine.encrypt(data, &key).unwrap();
            assert_ne!(&encrypted[..data.len().min(encrypted.len())], &data[..]);

            let decrypted = engine.decrypt(&encrypted, &key).unwrap();
            assert_eq!(decrypted, data);
        }
    }

    #[test]
    fn test_convergent_ciphertext_deterministic() {
        let engine = CryptoEngine::new(SecurityProfile::High);
        let data = b"same content, same bytes on the wire";
        let key = engine.derive_key(data);

        let c1 = engine.encrypt(data, &key).unwrap();
        let c2 = engine.encrypt(data, &key).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_low_profile_fingerprint_padding() {
        let engine = CryptoEngine::new(SecurityProfile::Low);
        let fp = engine.fingerprint(b"abc");
        // SHA-1 digest occupies the first 20 bytes, rest stays zero
        assert_ne!(&fp[..20], &[0u8; 20]);
        assert_eq!(&fp[20..], &[0u8; 12]);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let engine = CryptoEngine::new(SecurityProfile::High);
        let key = engine.derive_key(b"one");
        let other = engine.derive_key(b"two");
        let ct = engine.encrypt(b"payload", &key).unwrap();
        assert!(engine.decrypt(&ct, &other).is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let engine = CryptoEngine::new(SecurityProfile::High);
        let key = engine.passphrase_key("pw");

        let a = engine.seal(b"first message", &key).unwrap();
        let b = engine.seal(b"second message", &key).unwrap();
        // distinct plaintexts under one key get distinct nonces
        assert_ne!(a[..12], b[..12]);

        assert_eq!(engine.open(&a, &key).unwrap(), b"first message");
        assert_eq!(engine.open(&b, &key).unwrap(), b"second message");
        assert!(engine.open(&a[..8], &key).is_err());
    }

    #[test]
    fn test_passphrase_key_stable() {
        let engine = CryptoEngine::new(SecurityProfile::Low);
        let k1 = engine.passphrase_key("hunter2");
        let k2 = engine.passphrase_key("hunter2");
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k1.as_bytes(), engine.passphrase_key("other").as_bytes());
    }
}
