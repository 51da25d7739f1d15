//! JWT service tickets: an HS512 JWS wrapped in a compact JWE (`dir` + `C20P`).
//!
//! The JWE layer is ChaCha20-Poly1305 with the protected header as additional data; its
//! 16-byte tag is the last JWE segment.

use base64ct::{Base64UrlUnpadded, Encoding};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::{
    crypto::{KEY_LEN, random_bytes},
    error::CasError,
    principal::Attributes,
};

const TAG_LEN: usize = 16;
const RESERVED: [&str; 7] = ["iss", "aud", "sub", "jti", "iat", "exp", "credentialType"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtServiceTicketClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub jti: String,
    #[serde(rename = "credentialType")]
    pub credential_type: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(flatten)]
    pub attributes: Attributes,
}

pub struct JwtTicketCodec {
    issuer: String,
    signing_key: SecretSlice<u8>,
    encryption_key: [u8; KEY_LEN],
}

impl JwtTicketCodec {
    #[must_use]
    pub fn new(issuer: impl Into<String>, signing_key: Vec<u8>, encryption_key: [u8; KEY_LEN]) -> Self {
        Self {
            issuer: issuer.into(),
            signing_key: SecretSlice::from(signing_key),
            encryption_key,
        }
    }

    /// Codec with fresh random keys.
    ///
    /// # Errors
    /// Returns an error if the OS generator fails.
    pub fn generate(issuer: impl Into<String>) -> Result<Self, CasError> {
        Ok(Self::new(
            issuer,
            random_bytes::<64>()?.to_vec(),
            random_bytes::<KEY_LEN>()?,
        ))
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, CasError> {
        ChaCha20Poly1305::new_from_slice(&self.encryption_key)
            .map_err(|_| CasError::Internal("invalid ticket encryption key".to_string()))
    }

    /// Encode service ticket `ticket_id` for `service`.
    ///
    /// # Errors
    /// Returns `Internal` if signing or encryption fails.
    pub fn encode(
        &self,
        ticket_id: &str,
        service: &str,
        principal_id: &str,
        credential_type: &str,
        attributes: &Attributes,
        time_to_live_seconds: i64,
    ) -> Result<String, CasError> {
        let now = Utc::now().timestamp();
        let claims = JwtServiceTicketClaims {
            iss: self.issuer.clone(),
            aud: service.to_string(),
            sub: principal_id.to_string(),
            jti: ticket_id.to_string(),
            credential_type: credential_type.to_string(),
            iat: now,
            exp: now + time_to_live_seconds.max(1),
            attributes: attributes
                .iter()
                .filter(|(name, _)| !RESERVED.contains(&name.as_str()))
                .map(|(name, values)| (name.clone(), values.clone()))
                .collect(),
        };
        let jws = jsonwebtoken::encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(self.signing_key.expose_secret()),
        )
        .map_err(|err| CasError::Internal(format!("failed to sign service ticket: {err}")))?;

        let header = json!({"alg": "dir", "enc": "C20P", "cty": "JWT"}).to_string();
        let protected = Base64UrlUnpadded::encode_string(header.as_bytes());
        let nonce = random_bytes::<12>()?;
        let sealed = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: jws.as_bytes(),
                    aad: protected.as_bytes(),
                },
            )
            .map_err(|_| CasError::Internal("failed to encrypt service ticket".to_string()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{protected}..{}.{}.{}",
            Base64UrlUnpadded::encode_string(&nonce),
            Base64UrlUnpadded::encode_string(ciphertext),
            Base64UrlUnpadded::encode_string(tag)
        ))
    }

    /// Decrypt and verify a JWT service ticket. The audience is returned for the caller
    /// to compare against the presented service.
    ///
    /// # Errors
    /// Returns `TicketNotFound` for any malformed, forged or expired token.
    pub fn decode(&self, token: &str) -> Result<JwtServiceTicketClaims, CasError> {
        let invalid = || CasError::TicketNotFound(abbreviate(token));

        let parts: Vec<&str> = token.split('.').collect();
        let [protected, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
            return Err(invalid());
        };
        if !encrypted_key.is_empty() {
            return Err(invalid());
        }
        let header: serde_json::Value = Base64UrlUnpadded::decode_vec(protected)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(invalid)?;
        if header["alg"] != "dir" || header["enc"] != "C20P" {
            return Err(invalid());
        }

        let nonce = Base64UrlUnpadded::decode_vec(iv).map_err(|_| invalid())?;
        if nonce.len() != 12 {
            return Err(invalid());
        }
        let mut sealed = Base64UrlUnpadded::decode_vec(ciphertext).map_err(|_| invalid())?;
        sealed.extend(Base64UrlUnpadded::decode_vec(tag).map_err(|_| invalid())?);
        let jws = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: protected.as_bytes(),
                },
            )
            .map_err(|_| invalid())?;
        let jws = String::from_utf8(jws).map_err(|_| invalid())?;

        let mut validation = Validation::new(Algorithm::HS512);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);
        let claims = jsonwebtoken::decode::<JwtServiceTicketClaims>(
            &jws,
            &DecodingKey::from_secret(self.signing_key.expose_secret()),
            &validation,
        )
        .map_err(|_| invalid())?
        .claims;

        if claims.sub.trim().is_empty()
            || !claims.jti.starts_with("ST-")
            || claims.credential_type.trim().is_empty()
            || claims.aud.is_empty()
        {
            return Err(invalid());
        }
        Ok(claims)
    }
}

impl fmt::Debug for JwtTicketCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtTicketCodec")
            .field("issuer", &self.issuer)
            .field("signing_key", &"***")
            .field("encryption_key", &"***")
            .finish()
    }
}

/// Opaque tokens are long; error messages only carry their head.
fn abbreviate(token: &str) -> String {
    token.chars().take(16).collect()
}

/// JWT tickets are the only ticket form containing dots.
#[must_use]
pub fn is_jwt(ticket: &str) -> bool {
    ticket.contains('.')
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ISSUER: &str = "https://sso.example.org/cas";
    const SERVICE: &str = "https://app.example.org";

    fn codec() -> JwtTicketCodec {
        JwtTicketCodec::new(ISSUER, vec![7u8; 64], [9u8; KEY_LEN])
    }

    fn attributes() -> Attributes {
        [("mail".to_string(), vec!["casuser@example.org".to_string()])].into()
    }

    #[test]
    fn decodes_what_it_encodes() {
        let codec = codec();
        let token = codec
            .encode("ST-1-abc", SERVICE, "casuser", "UsernamePasswordCredential", &attributes(), 10)
            .unwrap();
        assert!(is_jwt(&token));
        assert_eq!(token.split('.').count(), 5);

        let claims = codec.decode(&token).unwrap();
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.aud, SERVICE);
        assert_eq!(claims.sub, "casuser");
        assert_eq!(claims.jti, "ST-1-abc");
        assert_eq!(claims.credential_type, "UsernamePasswordCredential");
        assert_eq!(claims.attributes["mail"], vec!["casuser@example.org"]);
    }

    #[test]
    fn rejects_non_service_ticket_ids() {
        let codec = codec();
        let token = codec
            .encode("TGT-1-abc", SERVICE, "casuser", "UsernamePasswordCredential", &attributes(), 10)
            .unwrap();
        assert!(matches!(codec.decode(&token), Err(CasError::TicketNotFound(_))));
    }

    #[test]
    fn rejects_missing_credential_type() {
        let codec = codec();
        let token = codec
            .encode("ST-1-abc", SERVICE, "casuser", "", &attributes(), 10)
            .unwrap();
        assert!(codec.decode(&token).is_err());
    }

    #[test]
    fn rejects_other_keys_and_issuers() {
        let token = codec()
            .encode("ST-1-abc", SERVICE, "casuser", "UsernamePasswordCredential", &attributes(), 10)
            .unwrap();

        let other_encryption = JwtTicketCodec::new(ISSUER, vec![7u8; 64], [1u8; KEY_LEN]);
        assert!(other_encryption.decode(&token).is_err());

        let other_signing = JwtTicketCodec::new(ISSUER, vec![1u8; 64], [9u8; KEY_LEN]);
        assert!(other_signing.decode(&token).is_err());

        let other_issuer = JwtTicketCodec::new("https://evil.example.org", vec![7u8; 64], [9u8; KEY_LEN]);
        assert!(other_issuer.decode(&token).is_err());
    }

    #[test]
    fn rejects_tampering() {
        let token = codec()
            .encode("ST-1-abc", SERVICE, "casuser", "UsernamePasswordCredential", &attributes(), 10)
            .unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[3] = Base64UrlUnpadded::encode_string(b"forged payload");
        assert!(codec().decode(&parts.join(".")).is_err());
        assert!(codec().decode("not-a-token").is_err());
    }
}
