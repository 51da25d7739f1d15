//! Google Authenticator style TOTP provider with single-use scratch codes.
//!
//! Seeds are kept sealed at rest; each verified time step is remembered so a token
//! cannot be replayed inside its validity window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info};

use crate::{
    authn::{AuthenticationHandler, Credential},
    crypto::{Sealer, constant_time_eq},
    error::CasError,
    principal::Principal,
};

pub const PROVIDER_ID: &str = "mfa-gauth";
pub const HANDLER_NAME: &str = "GoogleAuthenticatorAuthenticationHandler";

const DIGITS: usize = 6;
const STEP: u64 = 30;
const SKEW: i64 = 1;
const SCRATCH_CODES: usize = 5;

/// What the user sees while enrolling a device.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GauthRegistration {
    pub secret_key: String,
    /// PNG data URL.
    pub qr_code: String,
    pub scratch_codes: Vec<String>,
}

/// Registered account, as exposed to operators.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GauthAccount {
    pub username: String,
    pub registration_date: DateTime<Utc>,
    pub scratch_codes: Vec<String>,
}

struct Record {
    sealed_secret: String,
    registration_date: DateTime<Utc>,
    scratch_codes: Vec<String>,
    last_step: Option<u64>,
}

pub struct GoogleAuthenticator {
    issuer: String,
    sealer: Arc<Sealer>,
    accounts: Mutex<HashMap<String, Record>>,
}

fn totp(secret: Vec<u8>, issuer: &str, account: &str) -> Result<TOTP, CasError> {
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        1,
        STEP,
        secret,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|err| CasError::Internal(format!("TOTP init error: {err}")))
}

fn decode_secret(secret_base32: &str) -> Result<Vec<u8>, CasError> {
    Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|err| CasError::Internal(format!("invalid TOTP secret: {err}")))
}

fn scratch_code() -> String {
    format!("{:08}", rand::thread_rng().gen_range(0..100_000_000u32))
}

/// The time step `token` is valid for, allowing one step of clock skew either way.
fn matching_step(totp: &TOTP, token: &str, now: u64) -> Option<u64> {
    let current = now / STEP;
    (-SKEW..=SKEW).find_map(|offset| {
        let step = current.checked_add_signed(offset)?;
        let expected = totp.generate(step * STEP);
        constant_time_eq(expected.as_bytes(), token.as_bytes()).then_some(step)
    })
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

impl GoogleAuthenticator {
    #[must_use]
    pub fn new(issuer: impl Into<String>, sealer: Arc<Sealer>) -> Self {
        Self {
            issuer: issuer.into(),
            sealer,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    fn purpose(username: &str) -> String {
        format!("gauth:{username}")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Record>>, CasError> {
        self.accounts
            .lock()
            .map_err(|_| CasError::Internal("gauth repository lock poisoned".to_string()))
    }

    /// # Errors
    /// Returns an error if the repository lock is poisoned.
    pub fn is_registered(&self, username: &str) -> Result<bool, CasError> {
        Ok(self.lock()?.contains_key(username))
    }

    /// Generate a secret, QR code and scratch codes. Nothing is stored until
    /// [`Self::confirm_registration`] succeeds.
    ///
    /// # Errors
    /// Returns an error if the secret or QR code cannot be generated.
    pub fn prepare_registration(&self, username: &str) -> Result<GauthRegistration, CasError> {
        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|err| CasError::Internal(format!("Secret gen error: {err}")))?;
        let totp = totp(secret_bytes, &self.issuer, username)?;
        let qr = totp
            .get_qr_base64()
            .map_err(|err| CasError::Internal(format!("QR gen error: {err}")))?;
        Ok(GauthRegistration {
            secret_key: totp.get_secret_base32(),
            qr_code: format!("data:image/png;base64,{qr}"),
            scratch_codes: (0..SCRATCH_CODES).map(|_| scratch_code()).collect(),
        })
    }

    /// Store a prepared registration once the user proves possession with a token.
    ///
    /// # Errors
    /// `BadCredentials` when the token does not match the secret.
    pub fn confirm_registration(
        &self,
        username: &str,
        secret_base32: &str,
        scratch_codes: Vec<String>,
        token: &str,
    ) -> Result<(), CasError> {
        let totp = totp(decode_secret(secret_base32)?, &self.issuer, username)?;
        let step = matching_step(&totp, token.trim(), unix_now()).ok_or(CasError::BadCredentials)?;
        let sealed_secret = self
            .sealer
            .seal(secret_base32.as_bytes(), &Self::purpose(username))?;
        self.lock()?.insert(
            username.to_string(),
            Record {
                sealed_secret,
                registration_date: Utc::now(),
                scratch_codes,
                last_step: Some(step),
            },
        );
        info!(username, "registered google authenticator device");
        Ok(())
    }

    /// Verify a TOTP token or a scratch code.
    ///
    /// # Errors
    /// `MfaRegistrationRequired` without a registered device, `BadCredentials` for a
    /// wrong, replayed or already used code.
    pub fn verify(&self, username: &str, token: &str) -> Result<(), CasError> {
        self.verify_at(username, token, unix_now())
    }

    fn verify_at(&self, username: &str, token: &str, now: u64) -> Result<(), CasError> {
        let token = token.trim();
        let mut accounts = self.lock()?;
        let record = accounts
            .get_mut(username)
            .ok_or(CasError::MfaRegistrationRequired)?;

        if token.len() == DIGITS {
            let secret = self.sealer.open(&record.sealed_secret, &Self::purpose(username))?;
            let secret = String::from_utf8(secret)
                .map_err(|_| CasError::Internal("stored TOTP secret is not UTF-8".to_string()))?;
            let totp = totp(decode_secret(&secret)?, &self.issuer, username)?;
            let step = matching_step(&totp, token, now).ok_or(CasError::BadCredentials)?;
            if record.last_step.is_some_and(|last| step <= last) {
                debug!(username, "rejected replayed token");
                return Err(CasError::BadCredentials);
            }
            record.last_step = Some(step);
            return Ok(());
        }

        let position = record
            .scratch_codes
            .iter()
            .position(|code| constant_time_eq(code.as_bytes(), token.as_bytes()))
            .ok_or(CasError::BadCredentials)?;
        record.scratch_codes.remove(position);
        info!(
            username,
            remaining = record.scratch_codes.len(),
            "accepted scratch code"
        );
        Ok(())
    }

    /// # Errors
    /// Returns an error if the repository lock is poisoned.
    pub fn accounts(&self, username: Option<&str>) -> Result<Vec<GauthAccount>, CasError> {
        let accounts = self.lock()?;
        let mut listed: Vec<GauthAccount> = accounts
            .iter()
            .filter(|(name, _)| username.map_or(true, |username| username == name.as_str()))
            .map(|(name, record)| GauthAccount {
                username: name.clone(),
                registration_date: record.registration_date,
                scratch_codes: record.scratch_codes.clone(),
            })
            .collect();
        listed.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(listed)
    }

    /// # Errors
    /// Returns an error if the repository lock is poisoned.
    pub fn remove(&self, username: &str) -> Result<bool, CasError> {
        Ok(self.lock()?.remove(username).is_some())
    }
}

#[async_trait]
impl AuthenticationHandler for GoogleAuthenticator {
    fn name(&self) -> &str {
        HANDLER_NAME
    }

    fn supports(&self, credential: &Credential) -> bool {
        matches!(credential, Credential::OneTimeToken { provider, .. } if provider == PROVIDER_ID)
    }

    async fn authenticate(&self, credential: &Credential) -> Result<Principal, CasError> {
        let Credential::OneTimeToken {
            principal_id,
            token,
            ..
        } = credential
        else {
            return Err(CasError::AuthenticationFailed);
        };
        self.verify(principal_id, token)?;
        Ok(Principal::new(principal_id.clone()))
    }
}

impl std::fmt::Debug for GoogleAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleAuthenticator")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn provider() -> GoogleAuthenticator {
        GoogleAuthenticator::new("Tessera", Arc::new(Sealer::new([5u8; 32])))
    }

    fn token_for(secret: &str, time: u64) -> String {
        totp(decode_secret(secret).unwrap(), "Tessera", "casuser")
            .unwrap()
            .generate(time)
    }

    fn registered(provider: &GoogleAuthenticator) -> GauthRegistration {
        let registration = provider.prepare_registration("casuser").unwrap();
        let token = token_for(&registration.secret_key, unix_now());
        provider
            .confirm_registration(
                "casuser",
                &registration.secret_key,
                registration.scratch_codes.clone(),
                &token,
            )
            .unwrap();
        registration
    }

    #[test]
    fn registration_material() {
        let registration = provider().prepare_registration("casuser").unwrap();
        assert!(registration.qr_code.starts_with("data:image/png;base64,"));
        assert_eq!(registration.scratch_codes.len(), 5);
        assert!(registration
            .scratch_codes
            .iter()
            .all(|code| code.len() == 8 && code.chars().all(|c| c.is_ascii_digit())));
        assert!(!registration.secret_key.is_empty());
    }

    #[test]
    fn confirmation_requires_valid_token() {
        let provider = provider();
        let registration = provider.prepare_registration("casuser").unwrap();
        assert_eq!(
            provider.confirm_registration(
                "casuser",
                &registration.secret_key,
                registration.scratch_codes,
                "000000x"
            ),
            Err(CasError::BadCredentials)
        );
        assert!(!provider.is_registered("casuser").unwrap());
    }

    #[test]
    fn unregistered_users_must_register() {
        assert_eq!(
            provider().verify("nobody", "123456"),
            Err(CasError::MfaRegistrationRequired)
        );
    }

    #[test]
    fn tokens_cannot_be_replayed() {
        let provider = provider();
        let registration = registered(&provider);
        let later = unix_now() + 2 * STEP;
        let token = token_for(&registration.secret_key, later);

        assert!(provider.verify_at("casuser", &token, later).is_ok());
        assert_eq!(
            provider.verify_at("casuser", &token, later),
            Err(CasError::BadCredentials)
        );
    }

    #[test]
    fn scratch_codes_are_single_use() {
        let provider = provider();
        let registration = registered(&provider);
        let code = registration.scratch_codes[0].clone();

        assert!(provider.verify("casuser", &code).is_ok());
        assert_eq!(
            provider.verify("casuser", &code),
            Err(CasError::BadCredentials)
        );
        assert_eq!(
            provider.accounts(Some("casuser")).unwrap()[0].scratch_codes.len(),
            4
        );
    }

    #[tokio::test]
    async fn authenticates_one_time_token_credentials() {
        let provider = provider();
        let registration = registered(&provider);
        let credential = Credential::OneTimeToken {
            provider: PROVIDER_ID.to_string(),
            principal_id: "casuser".to_string(),
            token: registration.scratch_codes[1].clone(),
        };
        assert!(provider.supports(&credential));
        assert_eq!(provider.authenticate(&credential).await.unwrap().id, "casuser");
        assert!(!provider.supports(&Credential::OneTimeToken {
            provider: "mfa-duo".to_string(),
            principal_id: "casuser".to_string(),
            token: "1".to_string(),
        }));
    }

    #[test]
    fn remove_account() {
        let provider = provider();
        registered(&provider);
        assert!(provider.remove("casuser").unwrap());
        assert!(!provider.remove("casuser").unwrap());
        assert!(provider.accounts(None).unwrap().is_empty());
    }
}
