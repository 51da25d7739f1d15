//! Delegated authentication through upstream identity providers.
//!
//! Every provider call is bounded by a timeout; a slow provider surfaces the retryable
//! `ExternalProviderTimeout` instead of holding the login request.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tracing::warn;

use super::{AuthenticationHandler, Credential};
use crate::{error::CasError, principal::Principal};

#[async_trait]
pub trait DelegatedIdentityProvider: Send + Sync {
    fn client_name(&self) -> &str;

    /// # Errors
    /// Returns an error if the assertion is not acceptable.
    async fn verify(&self, assertion: &str) -> Result<Principal, CasError>;
}

/// Upstream provider that hands back an HS256-signed JWT assertion.
pub struct JwtIdentityProvider {
    client_name: String,
    issuer: String,
    audience: String,
    secret: SecretString,
}

impl JwtIdentityProvider {
    #[must_use]
    pub fn new(
        client_name: impl Into<String>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        secret: SecretString,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            issuer: issuer.into(),
            audience: audience.into(),
            secret,
        }
    }
}

impl fmt::Debug for JwtIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtIdentityProvider")
            .field("client_name", &self.client_name)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("secret", &"***")
            .finish()
    }
}

#[async_trait]
impl DelegatedIdentityProvider for JwtIdentityProvider {
    fn client_name(&self) -> &str {
        &self.client_name
    }

    async fn verify(&self, assertion: &str) -> Result<Principal, CasError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let data = decode::<HashMap<String, Value>>(assertion, &key, &validation).map_err(|e| {
            warn!(client = %self.client_name, "rejected delegated assertion: {}", e);
            CasError::ExternalProvider(self.client_name.clone())
        })?;

        let claims = data.claims;
        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| CasError::ExternalProvider(self.client_name.clone()))?;

        let mut principal =
            Principal::new(subject).with_attribute("clientName", [self.client_name.clone()]);
        for (name, value) in &claims {
            if matches!(name.as_str(), "sub" | "iss" | "aud" | "exp" | "iat" | "nbf" | "jti") {
                continue;
            }
            let values: Vec<String> = match value {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
                Value::Bool(_) | Value::Number(_) => vec![value.to_string()],
                _ => continue,
            };
            principal.attributes.insert(name.clone(), values);
        }
        Ok(principal)
    }
}

/// Routes `Credential::Delegated` to the named provider under a timeout.
pub struct DelegatedAuthenticationHandler {
    providers: HashMap<String, Arc<dyn DelegatedIdentityProvider>>,
    timeout: Duration,
}

impl DelegatedAuthenticationHandler {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            timeout,
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn DelegatedIdentityProvider>) -> Self {
        self.providers
            .insert(provider.client_name().to_string(), provider);
        self
    }

    #[must_use]
    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl AuthenticationHandler for DelegatedAuthenticationHandler {
    fn name(&self) -> &str {
        "DelegatedClientAuthenticationHandler"
    }

    fn supports(&self, credential: &Credential) -> bool {
        matches!(credential, Credential::Delegated { client_name, .. } if self.providers.contains_key(client_name))
    }

    async fn authenticate(&self, credential: &Credential) -> Result<Principal, CasError> {
        let Credential::Delegated {
            client_name,
            assertion,
        } = credential
        else {
            return Err(CasError::AuthenticationFailed);
        };
        let provider = self
            .providers
            .get(client_name)
            .ok_or(CasError::AuthenticationFailed)?;

        match tokio::time::timeout(self.timeout, provider.verify(assertion.expose_secret())).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(client = %client_name, "delegated provider timed out");
                Err(CasError::ExternalProviderTimeout(client_name.clone()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    fn provider() -> JwtIdentityProvider {
        JwtIdentityProvider::new(
            "UpstreamIdP",
            "https://idp.example.org",
            "tessera",
            SecretString::from("upstream-secret-upstream-secret!".to_string()),
        )
    }

    fn assertion(issuer: &str) -> String {
        let claims = json!({
            "sub": "delegated-user",
            "iss": issuer,
            "aud": "tessera",
            "exp": chrono::Utc::now().timestamp() + 60,
            "email": "delegated@example.org",
            "groups": ["staff", "faculty"],
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"upstream-secret-upstream-secret!"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn verifies_upstream_assertion() {
        let principal = provider()
            .verify(&assertion("https://idp.example.org"))
            .await
            .unwrap();
        assert_eq!(principal.id, "delegated-user");
        assert_eq!(principal.first("clientName"), Some("UpstreamIdP"));
        assert_eq!(principal.first("email"), Some("delegated@example.org"));
        assert_eq!(principal.attributes["groups"], vec!["staff", "faculty"]);
    }

    #[tokio::test]
    async fn rejects_wrong_issuer() {
        let err = provider()
            .verify(&assertion("https://evil.example.org"))
            .await
            .unwrap_err();
        assert_eq!(err, CasError::ExternalProvider("UpstreamIdP".to_string()));
    }

    struct SlowProvider;

    #[async_trait]
    impl DelegatedIdentityProvider for SlowProvider {
        fn client_name(&self) -> &str {
            "Slow"
        }

        async fn verify(&self, _assertion: &str) -> Result<Principal, CasError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Principal::new("never"))
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let handler = DelegatedAuthenticationHandler::new(Duration::from_millis(20))
            .with_provider(Arc::new(SlowProvider));
        let credential = Credential::Delegated {
            client_name: "Slow".to_string(),
            assertion: SecretString::from("x".to_string()),
        };
        assert!(handler.supports(&credential));
        let err = handler.authenticate(&credential).await.unwrap_err();
        assert_eq!(err, CasError::ExternalProviderTimeout("Slow".to_string()));
        assert!(err.is_retryable());
    }
}
