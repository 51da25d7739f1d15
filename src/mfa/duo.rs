//! Duo Security provider: passcodes are checked by an external verifier with a bounded
//! timeout; locally issued bypass codes work once each.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    APP_USER_AGENT,
    authn::{AuthenticationHandler, Credential},
    crypto::constant_time_eq,
    error::CasError,
    principal::Principal,
};

pub const PROVIDER_ID: &str = "mfa-duo";
pub const HANDLER_NAME: &str = "DuoSecurityAuthenticationHandler";

#[async_trait]
pub trait DuoVerifier: Send + Sync {
    /// # Errors
    /// Returns an error if the verifier cannot be reached.
    async fn verify(&self, username: &str, passcode: &str) -> Result<bool, CasError>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    username: &'a str,
    passcode: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    result: String,
}

/// Posts `{username, passcode}` to a verification endpoint that answers `{"result": "allow"}`.
#[derive(Debug, Clone)]
pub struct HttpDuoVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpDuoVerifier {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()
            .context("failed to build Duo client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DuoVerifier for HttpDuoVerifier {
    async fn verify(&self, username: &str, passcode: &str) -> Result<bool, CasError> {
        let response = self
            .client
            .post(&self.url)
            .json(&VerifyRequest { username, passcode })
            .send()
            .await
            .map_err(|err| {
                warn!("Duo verification request failed: {err}");
                CasError::ExternalProvider(PROVIDER_ID.to_string())
            })?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|_| CasError::ExternalProvider(PROVIDER_ID.to_string()))?;
        Ok(body.result.eq_ignore_ascii_case("allow"))
    }
}

pub struct DuoProvider {
    verifier: Option<Arc<dyn DuoVerifier>>,
    timeout: Duration,
    bypass_codes: Mutex<HashMap<String, Vec<String>>>,
}

impl DuoProvider {
    #[must_use]
    pub fn new(verifier: Option<Arc<dyn DuoVerifier>>, timeout: Duration) -> Self {
        Self {
            verifier,
            timeout,
            bypass_codes: Mutex::new(HashMap::new()),
        }
    }

    /// # Errors
    /// Returns an error if the bypass code lock is poisoned.
    pub fn add_bypass_codes(&self, username: &str, codes: Vec<String>) -> Result<(), CasError> {
        self.bypass_codes
            .lock()
            .map_err(|_| CasError::Internal("bypass code lock poisoned".to_string()))?
            .entry(username.to_string())
            .or_default()
            .extend(codes);
        Ok(())
    }

    fn take_bypass_code(&self, username: &str, passcode: &str) -> Result<bool, CasError> {
        let mut codes = self
            .bypass_codes
            .lock()
            .map_err(|_| CasError::Internal("bypass code lock poisoned".to_string()))?;
        let Some(user_codes) = codes.get_mut(username) else {
            return Ok(false);
        };
        let Some(position) = user_codes
            .iter()
            .position(|code| constant_time_eq(code.as_bytes(), passcode.as_bytes()))
        else {
            return Ok(false);
        };
        user_codes.remove(position);
        Ok(true)
    }

    /// # Errors
    /// `BadCredentials` for a rejected passcode, `ExternalProviderTimeout` when the
    /// verifier does not answer in time.
    pub async fn verify(&self, username: &str, passcode: &str) -> Result<(), CasError> {
        let passcode = passcode.trim();
        if self.take_bypass_code(username, passcode)? {
            info!(username, "accepted Duo bypass code");
            return Ok(());
        }
        let Some(verifier) = &self.verifier else {
            return Err(CasError::BadCredentials);
        };
        match tokio::time::timeout(self.timeout, verifier.verify(username, passcode)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(CasError::BadCredentials),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(username, "Duo verification timed out");
                Err(CasError::ExternalProviderTimeout(PROVIDER_ID.to_string()))
            }
        }
    }
}

#[async_trait]
impl AuthenticationHandler for DuoProvider {
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
        self.verify(principal_id, token).await?;
        Ok(Principal::new(principal_id.clone()))
    }
}

impl std::fmt::Debug for DuoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuoProvider")
            .field("verifier", &self.verifier.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct StaticVerifier(&'static str);

    #[async_trait]
    impl DuoVerifier for StaticVerifier {
        async fn verify(&self, _username: &str, passcode: &str) -> Result<bool, CasError> {
            Ok(passcode == self.0)
        }
    }

    struct SlowVerifier;

    #[async_trait]
    impl DuoVerifier for SlowVerifier {
        async fn verify(&self, _username: &str, _passcode: &str) -> Result<bool, CasError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn verifier_decides() {
        let provider = DuoProvider::new(
            Some(Arc::new(StaticVerifier("424242"))),
            Duration::from_secs(1),
        );
        assert!(provider.verify("casuser", "424242").await.is_ok());
        assert_eq!(
            provider.verify("casuser", "111111").await,
            Err(CasError::BadCredentials)
        );
    }

    #[tokio::test]
    async fn bypass_codes_are_single_use() {
        let provider = DuoProvider::new(None, Duration::from_secs(1));
        provider
            .add_bypass_codes("casuser", vec!["98765".to_string()])
            .unwrap();
        assert!(provider.verify("casuser", "98765").await.is_ok());
        assert_eq!(
            provider.verify("casuser", "98765").await,
            Err(CasError::BadCredentials)
        );
        // codes belong to one user
        provider
            .add_bypass_codes("casuser", vec!["11111".to_string()])
            .unwrap();
        assert!(provider.verify("other", "11111").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_verifier_times_out() {
        let provider = DuoProvider::new(Some(Arc::new(SlowVerifier)), Duration::from_millis(100));
        let err = provider.verify("casuser", "424242").await.unwrap_err();
        assert_eq!(err, CasError::ExternalProviderTimeout(PROVIDER_ID.to_string()));
        assert!(err.is_retryable());
    }
}
