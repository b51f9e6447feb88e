//! Sealing of keychain secrets
//!
//! Private keys and chain codes are kept in cleartext only while a keychain
//! is unlocked. At rest they exist solely as [`Sealed`] blobs produced by a
//! [`LockCipher`].
//!
//! The default cipher is Argon2id key derivation + AES-256-GCM:
//!
//! - every seal draws a fresh random salt and nonce
//! - the lock key is never stored
//! - tampering or a wrong lock key fails authentication

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Argon2id output length (256 bits for AES-256)
const ARGON2_OUTPUT_LEN: usize = 32;

/// Salt length for Argon2
const SALT_LEN: usize = 16;

/// Nonce length for AES-256-GCM
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
    #[error("Invalid ciphertext format")]
    InvalidFormat,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockParams {
    /// Memory cost in KiB
    pub m_cost_kib: u32,
    /// Iterations
    pub t_cost: u32,
    /// Lanes
    pub p_cost: u32,
}

impl Default for LockParams {
    /// 64 MiB, 3 iterations, 4 lanes.
    fn default() -> Self {
        Self {
            m_cost_kib: 65536,
            t_cost: 3,
            p_cost: 4,
        }
    }
}

/// A sealed secret:
/// [salt (16 bytes)][nonce (12 bytes)][ciphertext + tag]
#[derive(Clone, PartialEq, Eq)]
pub struct Sealed {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl Sealed {
    /// Serialize to bytes: salt || nonce || ciphertext
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SALT_LEN + NONCE_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LockError> {
        // salt + nonce + at least 1 byte of ciphertext + tag
        if bytes.len() < SALT_LEN + NONCE_LEN + TAG_LEN + 1 {
            return Err(LockError::InvalidFormat);
        }

        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];

        salt.copy_from_slice(&bytes[0..SALT_LEN]);
        nonce.copy_from_slice(&bytes[SALT_LEN..SALT_LEN + NONCE_LEN]);
        let ciphertext = bytes[SALT_LEN + NONCE_LEN..].to_vec();

        Ok(Self {
            salt,
            nonce,
            ciphertext,
        })
    }
}

impl std::fmt::Debug for Sealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealed")
            .field("len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Encrypts and decrypts keychain secrets under a caller-supplied lock key.
pub trait LockCipher {
    fn seal(&self, lock_key: &[u8], plaintext: &[u8]) -> Result<Sealed, LockError>;
    fn open(&self, lock_key: &[u8], sealed: &Sealed) -> Result<Zeroizing<Vec<u8>>, LockError>;
}

/// Argon2id + AES-256-GCM.
#[derive(Debug, Clone, Default)]
pub struct Argon2Cipher {
    params: LockParams,
}

impl Argon2Cipher {
    pub fn new(params: LockParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> LockParams {
        self.params
    }

    /// Derive an encryption key from a lock key using Argon2id
    fn derive_key(
        &self,
        lock_key: &[u8],
        salt: &[u8; SALT_LEN],
    ) -> Result<Zeroizing<[u8; ARGON2_OUTPUT_LEN]>, LockError> {
        let params = Params::new(
            self.params.m_cost_kib,
            self.params.t_cost,
            self.params.p_cost,
            Some(ARGON2_OUTPUT_LEN),
        )
        .map_err(|e| LockError::KeyDerivationFailed(e.to_string()))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; ARGON2_OUTPUT_LEN]);
        argon2
            .hash_password_into(lock_key, salt, &mut key[..])
            .map_err(|e| LockError::KeyDerivationFailed(e.to_string()))?;

        Ok(key)
    }
}

impl LockCipher for Argon2Cipher {
    fn seal(&self, lock_key: &[u8], plaintext: &[u8]) -> Result<Sealed, LockError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let nonce_arr = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_arr);

        let key = self.derive_key(lock_key, &salt)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| LockError::EncryptionFailed(e.to_string()))?;

        Ok(Sealed {
            salt,
            nonce,
            ciphertext,
        })
    }

    fn open(&self, lock_key: &[u8], sealed: &Sealed) -> Result<Zeroizing<Vec<u8>>, LockError> {
        let key = self.derive_key(lock_key, &sealed.salt)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|_| LockError::DecryptionFailed("Invalid lock key or corrupted data".to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
pub(crate) fn test_cipher() -> Argon2Cipher {
    Argon2Cipher::new(LockParams {
        m_cost_kib: 64,
        t_cost: 1,
        p_cost: 1,
    })
}
