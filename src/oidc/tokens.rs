//! ID token signing and the published key set.

use base64ct::{Base64UrlUnpadded, Encoding};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::DecodePrivateKey,
    traits::PublicKeyParts,
};
use secrecy::{ExposeSecret, SecretSlice};
use serde_json::{Map, Value, json};
use std::fmt;

use crate::{
    crypto::{sha256, sha256_hex},
    error::CasError,
};

pub enum IdTokenSigner {
    Hs256 {
        secret: SecretSlice<u8>,
    },
    Rs256 {
        kid: String,
        encoding: EncodingKey,
        /// base64url modulus and exponent
        n: String,
        e: String,
    },
}

impl IdTokenSigner {
    #[must_use]
    pub fn hs256(secret: Vec<u8>) -> Self {
        Self::Hs256 {
            secret: SecretSlice::from(secret),
        }
    }

    /// RSA signer from a PKCS#8 or PKCS#1 PEM private key.
    ///
    /// # Errors
    /// Returns an error if the key cannot be parsed.
    pub fn rs256_from_pem(pem: &str) -> anyhow::Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|err| anyhow::anyhow!("invalid RSA private key: {err}"))?;
        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes())?;
        let public = key.to_public_key();
        let modulus = public.n().to_bytes_be();
        let kid = sha256_hex(&modulus).chars().take(16).collect();
        Ok(Self::Rs256 {
            kid,
            encoding,
            n: Base64UrlUnpadded::encode_string(&modulus),
            e: Base64UrlUnpadded::encode_string(&public.e().to_bytes_be()),
        })
    }

    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        match self {
            Self::Hs256 { .. } => Algorithm::HS256,
            Self::Rs256 { .. } => Algorithm::RS256,
        }
    }

    #[must_use]
    pub const fn algorithm_name(&self) -> &'static str {
        match self {
            Self::Hs256 { .. } => "HS256",
            Self::Rs256 { .. } => "RS256",
        }
    }

    /// # Errors
    /// Returns `Internal` if signing fails.
    pub fn sign(&self, claims: &Map<String, Value>) -> Result<String, CasError> {
        let mut header = Header::new(self.algorithm());
        let key = match self {
            Self::Hs256 { secret } => EncodingKey::from_secret(secret.expose_secret()),
            Self::Rs256 { kid, encoding, .. } => {
                header.kid = Some(kid.clone());
                encoding.clone()
            }
        };
        jsonwebtoken::encode(&header, claims, &key)
            .map_err(|err| CasError::Internal(format!("failed to sign id token: {err}")))
    }

    /// Verify a token issued by this signer.
    ///
    /// # Errors
    /// `InvalidGrant` when the signature, issuer, audience or expiry does not check out.
    pub fn verify(&self, token: &str, issuer: &str, audience: &str) -> Result<Map<String, Value>, CasError> {
        let key = match self {
            Self::Hs256 { secret } => DecodingKey::from_secret(secret.expose_secret()),
            Self::Rs256 { n, e, .. } => DecodingKey::from_rsa_components(n, e)
                .map_err(|err| CasError::Internal(format!("invalid RSA key: {err}")))?,
        };
        let mut validation = Validation::new(self.algorithm());
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|err| CasError::InvalidGrant(format!("invalid id token: {err}")))
    }

    /// JWKS document; symmetric keys are never published.
    #[must_use]
    pub fn jwks(&self) -> Value {
        match self {
            Self::Hs256 { .. } => json!({"keys": []}),
            Self::Rs256 { kid, n, e, .. } => json!({
                "keys": [{
                    "kty": "RSA",
                    "use": "sig",
                    "alg": "RS256",
                    "kid": kid,
                    "n": n,
                    "e": e,
                }]
            }),
        }
    }
}

impl fmt::Debug for IdTokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hs256 { .. } => f.debug_struct("Hs256").finish_non_exhaustive(),
            Self::Rs256 { kid, .. } => f
                .debug_struct("Rs256")
                .field("kid", kid)
                .finish_non_exhaustive(),
        }
    }
}

/// `at_hash`: left half of the SHA-256 of the access token, base64url.
#[must_use]
pub fn at_hash(access_token: &str) -> String {
    let digest = sha256(access_token.as_bytes());
    Base64UrlUnpadded::encode_string(&digest[..digest.len() / 2])
}

/// Check a PKCE verifier against the stored challenge.
#[must_use]
pub fn verify_pkce(challenge: &str, method: Option<&str>, verifier: &str) -> bool {
    let computed = match method.unwrap_or("plain") {
        "S256" => Base64UrlUnpadded::encode_string(&sha256(verifier.as_bytes())),
        "plain" => verifier.to_string(),
        _ => return false,
    };
    crate::crypto::constant_time_eq(computed.as_bytes(), challenge.as_bytes())
}
