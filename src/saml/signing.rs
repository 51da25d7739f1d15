//! RSA-SHA256 signing key of the IdP.

use anyhow::Context;
use base64::{Engine, engine::general_purpose::STANDARD};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::DecodePrivateKey,
    signature::{SignatureEncoding, Signer, Verifier},
    traits::PublicKeyParts,
};
use sha2::Sha256;
use std::fmt;

use crate::error::CasError;

const GENERATED_KEY_BITS: usize = 2048;

pub struct SamlSigner {
    signing: SigningKey<Sha256>,
    verifying: VerifyingKey<Sha256>,
    modulus: String,
    exponent: String,
}

impl SamlSigner {
    fn from_key(key: RsaPrivateKey) -> Self {
        let public = key.to_public_key();
        let modulus = STANDARD.encode(public.n().to_bytes_be());
        let exponent = STANDARD.encode(public.e().to_bytes_be());
        Self {
            signing: SigningKey::<Sha256>::new(key),
            verifying: VerifyingKey::<Sha256>::new(public),
            modulus,
            exponent,
        }
    }

    /// Load a PKCS#8 or PKCS#1 PEM private key.
    ///
    /// # Errors
    /// Returns an error if the key cannot be parsed.
    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|err| anyhow::anyhow!("invalid RSA private key: {err}"))?;
        Ok(Self::from_key(key))
    }

    /// Fresh key for this process only.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate() -> anyhow::Result<Self> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), GENERATED_KEY_BITS)
            .context("failed to generate SAML signing key")?;
        Ok(Self::from_key(key))
    }

    /// Base64 RSASSA-PKCS1-v1_5 SHA-256 signature of `data`.
    ///
    /// # Errors
    /// Returns `Internal` if signing fails.
    pub fn sign(&self, data: &[u8]) -> Result<String, CasError> {
        let signature = self
            .signing
            .try_sign(data)
            .map_err(|err| CasError::Internal(format!("failed to sign SAML assertion: {err}")))?;
        Ok(STANDARD.encode(signature.to_bytes()))
    }

    #[must_use]
    pub fn verify(&self, data: &[u8], signature: &str) -> bool {
        let Ok(bytes) = STANDARD.decode(signature) else {
            return false;
        };
        Signature::try_from(bytes.as_slice())
            .is_ok_and(|signature| self.verifying.verify(data, &signature).is_ok())
    }

    /// `ds:KeyInfo` with the raw RSA public key.
    #[must_use]
    pub fn key_info(&self) -> String {
        format!(
            "<ds:KeyInfo><ds:KeyValue><ds:RSAKeyValue><ds:Modulus>{}</ds:Modulus><ds:Exponent>{}</ds:Exponent></ds:RSAKeyValue></ds:KeyValue></ds:KeyInfo>",
            self.modulus, self.exponent
        )
    }
}

impl fmt::Debug for SamlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamlSigner")
            .field("exponent", &self.exponent)
            .finish_non_exhaustive()
    }
}
