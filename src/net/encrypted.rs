//! AES-GCM gossip encryption.
//!
//! Envelope layout (wire contract): `[version:u8][nonce:12][ciphertext][tag:16]`.
//! Version 1 seals the payload as-is; version 0 additionally PKCS7-pads the
//! plaintext to the AES block size (a legacy of older peers). The cluster
//! label rides as additional authenticated data, so mislabeled ciphertext
//! fails authentication without being decryptable.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, aead::consts::U12};
use std::sync::{Arc, Mutex};

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Highest envelope version we emit and accept.
pub const MAX_ENCRYPTION_VERSION: u8 = 1;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const VERSION_SIZE: usize = 1;
const BLOCK_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key must be 16, 24 or 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("no keys installed")]
    NoInstalledKeys,

    #[error("key not installed")]
    KeyNotInstalled,

    #[error("refusing to remove the primary key")]
    RemovePrimary,

    #[error("unsupported encryption version {0}")]
    UnsupportedVersion(u8),

    #[error("payload too small to decrypt")]
    PayloadTooSmall,

    #[error("no installed key could decrypt the payload")]
    NoKeyMatch,

    #[error("encryption failed")]
    SealFailed,

    #[error("bad padding")]
    BadPadding,
}

fn validate_key(key: &[u8]) -> Result<(), CryptoError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        n => Err(CryptoError::BadKeyLength(n)),
    }
}

// =============================================================================
// KEY RING
// =============================================================================

/// Ordered set of installed keys. The key at index 0 is the primary and
/// encrypts all outbound traffic; decryption tries every installed key, which
/// is what makes online key rotation possible.
///
/// Cloning yields a handle to the same ring.
#[derive(Clone)]
pub struct Keyring {
    keys: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Keyring {
    /// Build a ring from a primary key plus any number of secondaries.
    pub fn new(primary: Vec<u8>, secondaries: Vec<Vec<u8>>) -> Result<Self, CryptoError> {
        validate_key(&primary)?;
        for key in &secondaries {
            validate_key(key)?;
        }
        let mut keys = vec![primary];
        for key in secondaries {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(Self {
            keys: Arc::new(Mutex::new(keys)),
        })
    }

    /// Install a key without making it primary. Idempotent.
    pub fn add_key(&self, key: Vec<u8>) -> Result<(), CryptoError> {
        validate_key(&key)?;
        let mut keys = self.keys.lock().unwrap();
        if !keys.contains(&key) {
            keys.push(key);
        }
        Ok(())
    }

    /// Promote an installed key to primary.
    pub fn use_key(&self, key: &[u8]) -> Result<(), CryptoError> {
        let mut keys = self.keys.lock().unwrap();
        let Some(pos) = keys.iter().position(|k| k == key) else {
            return Err(CryptoError::KeyNotInstalled);
        };
        let key = keys.remove(pos);
        keys.insert(0, key);
        Ok(())
    }

    /// Remove an installed key; the primary cannot be removed.
    pub fn remove_key(&self, key: &[u8]) -> Result<(), CryptoError> {
        let mut keys = self.keys.lock().unwrap();
        let Some(pos) = keys.iter().position(|k| k == key) else {
            return Err(CryptoError::KeyNotInstalled);
        };
        if pos == 0 {
            return Err(CryptoError::RemovePrimary);
        }
        keys.remove(pos);
        Ok(())
    }

    pub fn primary_key(&self) -> Vec<u8> {
        self.keys.lock().unwrap()[0].clone()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keys.lock().unwrap().clone()
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let nonce = GenericArray::from_slice(nonce);
    match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .encrypt(nonce, payload)
            .map_err(|_| CryptoError::SealFailed),
        24 => Aes192Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .encrypt(nonce, payload)
            .map_err(|_| CryptoError::SealFailed),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .encrypt(nonce, payload)
            .map_err(|_| CryptoError::SealFailed),
        n => Err(CryptoError::BadKeyLength(n)),
    }
}

fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let nonce = GenericArray::from_slice(nonce);
    match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .decrypt(nonce, payload)
            .map_err(|_| CryptoError::NoKeyMatch),
        24 => Aes192Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .decrypt(nonce, payload)
            .map_err(|_| CryptoError::NoKeyMatch),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .decrypt(nonce, payload)
            .map_err(|_| CryptoError::NoKeyMatch),
        n => Err(CryptoError::BadKeyLength(n)),
    }
}

fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = BLOCK_SIZE - (buf.len() % BLOCK_SIZE);
    buf.extend(std::iter::repeat(pad as u8).take(pad));
}

fn pkcs7_unpad(buf: &mut Vec<u8>) -> Result<(), CryptoError> {
    let Some(&pad) = buf.last() else {
        return Err(CryptoError::BadPadding);
    };
    let pad = pad as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > buf.len() {
        return Err(CryptoError::BadPadding);
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}

/// Wire size of an envelope holding `inner` bytes at `version`.
pub fn encrypted_length(version: u8, inner: usize) -> usize {
    let padded = if version == 0 {
        inner + (BLOCK_SIZE - inner % BLOCK_SIZE)
    } else {
        inner
    };
    VERSION_SIZE + NONCE_SIZE + padded + TAG_SIZE
}

/// Seal `plaintext` with the given key under a fresh random nonce.
pub fn encrypt_payload(
    version: u8,
    key: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if version > MAX_ENCRYPTION_VERSION {
        return Err(CryptoError::UnsupportedVersion(version));
    }

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut msg = plaintext.to_vec();
    if version == 0 {
        pkcs7_pad(&mut msg);
    }
    let sealed = seal(key, nonce.as_slice(), &msg, aad)?;

    let mut out = Vec::with_capacity(VERSION_SIZE + NONCE_SIZE + sealed.len());
    out.push(version);
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open an envelope, trying every installed key in order.
pub fn decrypt_payload(
    keys: &[Vec<u8>],
    envelope: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if keys.is_empty() {
        return Err(CryptoError::NoInstalledKeys);
    }
    if envelope.len() < VERSION_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::PayloadTooSmall);
    }
    let version = envelope[0];
    if version > MAX_ENCRYPTION_VERSION {
        return Err(CryptoError::UnsupportedVersion(version));
    }
    let nonce = &envelope[VERSION_SIZE..VERSION_SIZE + NONCE_SIZE];
    let ciphertext = &envelope[VERSION_SIZE + NONCE_SIZE..];

    for key in keys {
        if let Ok(mut plain) = open(key, nonce, ciphertext, aad) {
            if version == 0 {
                pkcs7_unpad(&mut plain)?;
            }
            return Ok(plain);
        }
    }
    Err(CryptoError::NoKeyMatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    #[test]
    fn test_keyring_validates_lengths() {
        assert!(Keyring::new(key(1, 16), vec![]).is_ok());
        assert!(Keyring::new(key(1, 24), vec![]).is_ok());
        assert!(Keyring::new(key(1, 32), vec![]).is_ok());
        assert!(Keyring::new(key(1, 15), vec![]).is_err());
        assert!(Keyring::new(key(1, 16), vec![key(2, 33)]).is_err());
    }

    #[test]
    fn test_keyring_rotation() {
        let ring = Keyring::new(key(1, 16), vec![key(2, 16)]).unwrap();
        assert_eq!(ring.primary_key(), key(1, 16));

        ring.use_key(&key(2, 16)).unwrap();
        assert_eq!(ring.primary_key(), key(2, 16));
        assert_eq!(ring.keys().len(), 2);

        // The primary is pinned.
        assert!(matches!(
            ring.remove_key(&key(2, 16)),
            Err(CryptoError::RemovePrimary)
        ));
        ring.remove_key(&key(1, 16)).unwrap();
        assert_eq!(ring.keys().len(), 1);

        assert!(ring.use_key(&key(9, 16)).is_err());
    }

    #[test]
    fn test_round_trip_all_key_sizes_and_versions() {
        for len in [16, 24, 32] {
            for version in [0u8, 1] {
                let k = key(7, len);
                let envelope =
                    encrypt_payload(version, &k, b"some gossip", b"cluster-label").unwrap();
                assert_eq!(envelope[0], version);
                assert_eq!(envelope.len(), encrypted_length(version, b"some gossip".len()));

                let plain =
                    decrypt_payload(&[k], &envelope, b"cluster-label").unwrap();
                assert_eq!(plain, b"some gossip");
            }
        }
    }

    #[test]
    fn test_decrypt_tries_all_keys() {
        let k1 = key(1, 16);
        let k2 = key(2, 32);
        let envelope = encrypt_payload(1, &k2, b"payload", b"").unwrap();

        let plain = decrypt_payload(&[k1, k2], &envelope, b"").unwrap();
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let k = key(3, 16);
        let envelope = encrypt_payload(1, &k, b"payload", b"label-a").unwrap();
        assert!(decrypt_payload(&[k], &envelope, b"label-b").is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = encrypt_payload(1, &key(1, 16), b"payload", b"").unwrap();
        assert!(matches!(
            decrypt_payload(&[key(2, 16)], &envelope, b""),
            Err(CryptoError::NoKeyMatch)
        ));
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        let k = key(1, 16);
        assert!(matches!(
            decrypt_payload(&[k.clone()], &[1, 2, 3], b""),
            Err(CryptoError::PayloadTooSmall)
        ));

        let mut envelope = encrypt_payload(1, &k, b"payload", b"").unwrap();
        envelope[0] = 9;
        assert!(matches!(
            decrypt_payload(&[k], &envelope, b""),
            Err(CryptoError::UnsupportedVersion(9))
        ));
    }
}
