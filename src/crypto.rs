//! Randomness, hashing and authenticated sealing helpers.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::error::CasError;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to gather randomness")]
    Random,
    #[error("invalid key: expected {} bytes of hex", KEY_LEN)]
    InvalidKey,
    #[error("sealing failed")]
    Seal,
    #[error("sealed value is malformed or was tampered with")]
    Open,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CryptoError> for CasError {
    fn from(err: CryptoError) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Fill `N` bytes from the OS generator.
///
/// # Errors
/// Returns an error if the OS generator fails.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| CryptoError::Random)?;
    Ok(bytes)
}

/// 32 random bytes, URL-safe base64 without padding.
///
/// # Errors
/// Returns an error if the OS generator fails.
pub fn random_token() -> Result<String, CryptoError> {
    let bytes = random_bytes::<32>()?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[must_use]
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// ChaCha20-Poly1305 sealing of small values carried by clients (cookies, flow tokens).
///
/// Output is `base64url(nonce || ciphertext)`; the purpose string is bound as AAD so a
/// value sealed for one purpose never opens for another.
#[derive(Clone)]
pub struct Sealer {
    key: [u8; KEY_LEN],
}

impl Sealer {
    #[must_use]
    pub const fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Parse a 64 character hex key.
    ///
    /// # Errors
    /// Returns an error if the value is not 32 bytes of hex.
    pub fn from_hex(value: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(value.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { key })
    }

    /// # Errors
    /// Returns an error if the OS generator fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            key: random_bytes::<KEY_LEN>()?,
        })
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, CryptoError> {
        ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKey)
    }

    /// # Errors
    /// Returns an error if encryption fails.
    pub fn seal(&self, plaintext: &[u8], purpose: &str) -> Result<String, CryptoError> {
        let nonce_bytes = random_bytes::<NONCE_LEN>()?;
        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: purpose.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// # Errors
    /// Returns an error if the value is malformed, sealed under another key or purpose.
    pub fn open(&self, sealed: &str, purpose: &str) -> Result<Vec<u8>, CryptoError> {
        let data = URL_SAFE_NO_PAD
            .decode(sealed.trim())
            .map_err(|_| CryptoError::Open)?;
        if data.len() <= NONCE_LEN {
            return Err(CryptoError::Open);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: purpose.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Open)
    }

    /// # Errors
    /// Returns an error if serialization or sealing fails.
    pub fn seal_json<T: Serialize>(&self, value: &T, purpose: &str) -> Result<String, CryptoError> {
        let json = serde_json::to_vec(value)?;
        self.seal(&json, purpose)
    }

    /// # Errors
    /// Returns an error if the value cannot be opened or deserialized.
    pub fn open_json<T: DeserializeOwned>(
        &self,
        sealed: &str,
        purpose: &str,
    ) -> Result<T, CryptoError> {
        let json = self.open(sealed, purpose)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").field("key", &"***").finish()
    }
}
