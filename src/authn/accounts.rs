//! Static account repository and its username/password handler.
//!
//! Accounts are loaded from JSON:
//!
//! ```json
//! { "casuser": { "password": "Mellon", "status": "ok", "attributes": { "mail": ["casuser@example.org"] } } }
//! ```
//!
//! Passwords are either plain text (compared in constant time) or an Argon2 PHC string.
//! The password is always verified before the account status is looked at, and unknown
//! users are verified against a dummy value, so every path costs the same.

use anyhow::{Context, Result};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use async_trait::async_trait;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path};

use super::{AuthenticationHandler, Credential};
use crate::{
    crypto::constant_time_eq,
    error::CasError,
    principal::{Attributes, Principal},
};

const DUMMY_PASSWORD: &str = "tessera-dummy-password";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Ok,
    Locked,
    Disabled,
    MustChangePassword,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Account {
    pub password: SecretString,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug)]
pub struct AccountsAuthenticationHandler {
    accounts: HashMap<String, Account>,
    dummy_hash: Option<String>,
}

impl AccountsAuthenticationHandler {
    /// # Errors
    /// Returns an error if a dummy Argon2 hash cannot be produced.
    pub fn new(accounts: HashMap<String, Account>) -> Result<Self> {
        let uses_argon2 = accounts
            .values()
            .any(|account| account.password.expose_secret().starts_with("$argon2"));
        let dummy_hash = if uses_argon2 {
            let salt = SaltString::generate(&mut OsRng);
            let hash = Argon2::default()
                .hash_password(DUMMY_PASSWORD.as_bytes(), &salt)
                .map_err(|e| anyhow::anyhow!("failed to hash dummy password: {e}"))?;
            Some(hash.to_string())
        } else {
            None
        };
        Ok(Self {
            accounts,
            dummy_hash,
        })
    }

    /// # Errors
    /// Returns an error if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let accounts: HashMap<String, Account> =
            serde_json::from_str(json).context("Invalid accounts JSON")?;
        Self::new(accounts)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read accounts file: {}", path.display()))?;
        Self::from_json(&json)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    fn verify(stored: &str, presented: &str) -> bool {
        if stored.starts_with("$argon2") {
            PasswordHash::new(stored).is_ok_and(|hash| {
                Argon2::default()
                    .verify_password(presented.as_bytes(), &hash)
                    .is_ok()
            })
        } else {
            constant_time_eq(stored.as_bytes(), presented.as_bytes())
        }
    }

    fn dummy(&self) -> &str {
        self.dummy_hash.as_deref().unwrap_or(DUMMY_PASSWORD)
    }
}

#[async_trait]
impl AuthenticationHandler for AccountsAuthenticationHandler {
    fn name(&self) -> &str {
        "StaticAccountsAuthenticationHandler"
    }

    fn supports(&self, credential: &Credential) -> bool {
        matches!(credential, Credential::UsernamePassword { .. })
    }

    async fn authenticate(&self, credential: &Credential) -> Result<Principal, CasError> {
        let Credential::UsernamePassword { username, password } = credential else {
            return Err(CasError::AuthenticationFailed);
        };

        let account = self.accounts.get(username.trim());
        let stored = account.map_or_else(|| self.dummy(), |a| a.password.expose_secret());
        let matched = Self::verify(stored, password.expose_secret());

        let Some(account) = account else {
            return Err(CasError::BadCredentials);
        };

        match account.status {
            AccountStatus::Locked => Err(CasError::AccountLocked),
            AccountStatus::Disabled => Err(CasError::AccountDisabled),
            _ if !matched => Err(CasError::BadCredentials),
            AccountStatus::MustChangePassword => Err(CasError::MustChangePassword),
            AccountStatus::Ok => Ok(Principal {
                id: username.trim().to_string(),
                attributes: account.attributes.clone(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ACCOUNTS: &str = r#"{
        "casuser": { "password": "Mellon", "attributes": { "mail": ["casuser@example.org"] } },
        "locked": { "password": "Mellon", "status": "locked" },
        "disabled": { "password": "Mellon", "status": "disabled" },
        "expired": { "password": "Mellon", "status": "must_change_password" }
    }"#;

    fn credential(username: &str, password: &str) -> Credential {
        Credential::UsernamePassword {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        }
    }

    #[tokio::test]
    async fn valid_password() {
        let handler = AccountsAuthenticationHandler::from_json(ACCOUNTS).unwrap();
        let principal = handler
            .authenticate(&credential("casuser", "Mellon"))
            .await
            .unwrap();
        assert_eq!(principal.id, "casuser");
        assert_eq!(principal.first("mail"), Some("casuser@example.org"));
    }

    #[tokio::test]
    async fn unknown_user_and_wrong_password_share_error() {
        let handler = AccountsAuthenticationHandler::from_json(ACCOUNTS).unwrap();
        let wrong = handler
            .authenticate(&credential("casuser", "nope"))
            .await
            .unwrap_err();
        let unknown = handler
            .authenticate(&credential("ghost", "Mellon"))
            .await
            .unwrap_err();
        assert_eq!(wrong, CasError::BadCredentials);
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn locked_account_ignores_password_correctness() {
        let handler = AccountsAuthenticationHandler::from_json(ACCOUNTS).unwrap();
        for password in ["Mellon", "wrong"] {
            let err = handler
                .authenticate(&credential("locked", password))
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "This account has been locked.");
        }
    }

    #[tokio::test]
    async fn other_statuses() {
        let handler = AccountsAuthenticationHandler::from_json(ACCOUNTS).unwrap();
        assert_eq!(
            handler
                .authenticate(&credential("disabled", "Mellon"))
                .await
                .unwrap_err(),
            CasError::AccountDisabled
        );
        assert_eq!(
            handler
                .authenticate(&credential("expired", "Mellon"))
                .await
                .unwrap_err(),
            CasError::MustChangePassword
        );
        assert_eq!(
            handler
                .authenticate(&credential("expired", "wrong"))
                .await
                .unwrap_err(),
            CasError::BadCredentials
        );
    }

    #[tokio::test]
    async fn argon2_hashes_are_verified() {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(b"Mellon", &salt)
            .unwrap()
            .to_string();
        let json = serde_json::json!({ "hashed": { "password": hash } }).to_string();
        let handler = AccountsAuthenticationHandler::from_json(&json).unwrap();
        assert!(handler
            .authenticate(&credential("hashed", "Mellon"))
            .await
            .is_ok());
        assert_eq!(
            handler
                .authenticate(&credential("hashed", "wrong"))
                .await
                .unwrap_err(),
            CasError::BadCredentials
        );
        assert_eq!(
            handler
                .authenticate(&credential("ghost", "wrong"))
                .await
                .unwrap_err(),
            CasError::BadCredentials
        );
    }
}
