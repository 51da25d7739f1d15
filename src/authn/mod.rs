//! Credential verification and authentication events.
//!
//! A [`Credential`] is routed to the first [`AuthenticationHandler`] that supports it. The
//! [`AuthenticationManager`] wraps that with login throttling and attribute resolution and
//! produces the [`Authentication`] event that is embedded in a TGT.

pub mod accounts;
pub mod delegated;
pub mod throttle;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    error::CasError,
    principal::{Attributes, Principal, PrincipalResolver},
};

use self::throttle::LoginThrottle;

pub const ACR_MFA: &str = "https://refeds.org/profile/mfa";
pub const ACR_PASSWORD: &str = "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";

pub const CREDENTIAL_USERNAME_PASSWORD: &str = "UsernamePasswordCredential";
pub const CREDENTIAL_ONE_TIME_TOKEN: &str = "OneTimeTokenCredential";
pub const CREDENTIAL_DELEGATED: &str = "ClientCredential";
pub const CREDENTIAL_OAUTH_CLIENT: &str = "OAuthClientCredential";

#[derive(Clone)]
pub enum Credential {
    UsernamePassword {
        username: String,
        password: SecretString,
    },
    /// TOTP, scratch or bypass code for an MFA provider.
    OneTimeToken {
        provider: String,
        principal_id: String,
        token: String,
    },
    /// Signed assertion from an upstream identity provider.
    Delegated {
        client_name: String,
        assertion: SecretString,
    },
}

impl Credential {
    #[must_use]
    pub const fn credential_type(&self) -> &'static str {
        match self {
            Self::UsernamePassword { .. } => CREDENTIAL_USERNAME_PASSWORD,
            Self::OneTimeToken { .. } => CREDENTIAL_ONE_TIME_TOKEN,
            Self::Delegated { .. } => CREDENTIAL_DELEGATED,
        }
    }

    /// `amr` value reported in OIDC tokens.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::UsernamePassword { .. } => "pwd",
            Self::OneTimeToken { .. } => "otp",
            Self::Delegated { .. } => "ext",
        }
    }

    /// Identifier used for throttling and logs.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::UsernamePassword { username, .. } => username,
            Self::OneTimeToken { principal_id, .. } => principal_id,
            Self::Delegated { client_name, .. } => client_name,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Self::OneTimeToken {
                provider,
                principal_id,
                ..
            } => f
                .debug_struct("OneTimeToken")
                .field("provider", provider)
                .field("principal_id", principal_id)
                .field("token", &"***")
                .finish(),
            Self::Delegated { client_name, .. } => f
                .debug_struct("Delegated")
                .field("client_name", client_name)
                .field("assertion", &"***")
                .finish(),
        }
    }
}

/// One completed authentication, embedded in the TGT it produced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Authentication {
    pub principal: Principal,
    /// Second granularity, matching `auth_time` in OIDC.
    pub auth_time: DateTime<Utc>,
    pub credential_type: String,
    pub handlers: Vec<String>,
    pub methods: Vec<String>,
    pub context_class: String,
    #[serde(default)]
    pub mfa_provider: Option<String>,
}

impl Authentication {
    #[must_use]
    pub fn new(
        principal: Principal,
        credential_type: impl Into<String>,
        handler: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            principal,
            auth_time: Utc::now().trunc_subsecs(0),
            credential_type: credential_type.into(),
            handlers: vec![handler.into()],
            methods: vec![method.into()],
            context_class: ACR_PASSWORD.to_string(),
            mfa_provider: None,
        }
    }

    /// Record a satisfied MFA step.
    #[must_use]
    pub fn with_mfa(mut self, provider: &str, handler: &str) -> Self {
        self.handlers.push(handler.to_string());
        if !self.methods.iter().any(|m| m == "mfa") {
            self.methods.push("mfa".to_string());
        }
        self.context_class = ACR_MFA.to_string();
        self.mfa_provider = Some(provider.to_string());
        self
    }

    #[must_use]
    pub fn is_mfa(&self) -> bool {
        self.mfa_provider.is_some()
    }

    /// Guarantee `auth_time` is strictly after `previous`, so a forced renewal is
    /// always observable even within the same second.
    #[must_use]
    pub fn renewed_after(mut self, previous: DateTime<Utc>) -> Self {
        if self.auth_time <= previous {
            self.auth_time = previous.trunc_subsecs(0) + Duration::seconds(1);
        }
        self
    }

    /// Authentication metadata released next to principal attributes.
    #[must_use]
    pub fn attributes(&self, from_new_login: bool) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(
            "authenticationDate".to_string(),
            vec![self.auth_time.to_rfc3339()],
        );
        attributes.insert(
            "credentialType".to_string(),
            vec![self.credential_type.clone()],
        );
        attributes.insert(
            "successfulAuthenticationHandlers".to_string(),
            self.handlers.clone(),
        );
        attributes.insert("authenticationMethod".to_string(), self.methods.clone());
        attributes.insert(
            "authnContextClass".to_string(),
            vec![self.context_class.clone()],
        );
        if let Some(provider) = &self.mfa_provider {
            attributes.insert("authenticationContext".to_string(), vec![provider.clone()]);
        }
        attributes.insert(
            "isFromNewLogin".to_string(),
            vec![from_new_login.to_string()],
        );
        attributes
    }
}

#[async_trait]
pub trait AuthenticationHandler: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, credential: &Credential) -> bool;

    /// # Errors
    /// Returns `BadCredentials`, `AccountLocked`, `AccountDisabled`, `MustChangePassword`,
    /// or a provider failure.
    async fn authenticate(&self, credential: &Credential) -> Result<Principal, CasError>;
}

pub struct AuthenticationManager {
    handlers: Vec<Arc<dyn AuthenticationHandler>>,
    resolver: PrincipalResolver,
    throttle: Arc<LoginThrottle>,
}

impl AuthenticationManager {
    #[must_use]
    pub fn new(resolver: PrincipalResolver, throttle: Arc<LoginThrottle>) -> Self {
        Self {
            handlers: Vec::new(),
            resolver,
            throttle,
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn AuthenticationHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Authenticate a primary credential.
    ///
    /// # Errors
    /// Returns `Throttled` when the client has too many recent failures, otherwise the
    /// handler's failure. `AuthenticationFailed` when no handler supports the credential.
    pub async fn authenticate(
        &self,
        credential: &Credential,
        client_ip: &str,
    ) -> Result<Authentication, CasError> {
        let throttled = matches!(credential, Credential::UsernamePassword { .. });
        if throttled {
            self.throttle.check(client_ip, credential.id())?;
        }

        let handler = self
            .handlers
            .iter()
            .find(|handler| handler.supports(credential))
            .ok_or(CasError::AuthenticationFailed)?;

        match handler.authenticate(credential).await {
            Ok(principal) => {
                if throttled {
                    self.throttle.record_success(client_ip, credential.id());
                }
                let principal = self.resolver.resolve(principal);
                info!(
                    principal = %principal.id,
                    handler = handler.name(),
                    "authentication succeeded"
                );
                Ok(Authentication::new(
                    principal,
                    credential.credential_type(),
                    handler.name(),
                    credential.method(),
                ))
            }
            Err(err) => {
                if throttled && matches!(err, CasError::BadCredentials) {
                    self.throttle.record_failure(client_ip, credential.id());
                }
                if err.is_retryable() {
                    warn!(handler = handler.name(), "authentication unavailable: {}", err);
                } else {
                    debug!(handler = handler.name(), "authentication failed: {}", err);
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for AuthenticationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationManager")
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::principal::{MergeStrategy, StaticAttributeRepository};
    use std::time::Duration as StdDuration;

    struct FixedHandler;

    #[async_trait]
    impl AuthenticationHandler for FixedHandler {
        fn name(&self) -> &str {
            "fixed"
        }

        fn supports(&self, credential: &Credential) -> bool {
            matches!(credential, Credential::UsernamePassword { .. })
        }

        async fn authenticate(&self, credential: &Credential) -> Result<Principal, CasError> {
            match credential {
                Credential::UsernamePassword { username, password }
                    if secrecy::ExposeSecret::expose_secret(password) == "Mellon" =>
                {
                    Ok(Principal::new(username.clone()))
                }
                _ => Err(CasError::BadCredentials),
            }
        }
    }

    fn password(username: &str, value: &str) -> Credential {
        Credential::UsernamePassword {
            username: username.to_string(),
            password: SecretString::from(value.to_string()),
        }
    }

    fn manager(threshold: u32) -> AuthenticationManager {
        let repository = StaticAttributeRepository::new("static").with_entry(
            "casuser",
            [("mail".to_string(), vec!["casuser@example.org".to_string()])].into(),
        );
        AuthenticationManager::new(
            PrincipalResolver::new(MergeStrategy::Multivalued)
                .with_repository(Arc::new(repository)),
            Arc::new(LoginThrottle::new(threshold, StdDuration::from_secs(60))),
        )
        .with_handler(Arc::new(FixedHandler))
    }

    #[tokio::test]
    async fn successful_authentication_resolves_attributes() {
        let authentication = manager(5)
            .authenticate(&password("casuser", "Mellon"), "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(authentication.principal.id, "casuser");
        assert_eq!(
            authentication.principal.first("mail"),
            Some("casuser@example.org")
        );
        assert_eq!(authentication.credential_type, CREDENTIAL_USERNAME_PASSWORD);
        assert_eq!(authentication.context_class, ACR_PASSWORD);
        assert_eq!(authentication.auth_time.timestamp_subsec_nanos(), 0);
    }

    #[tokio::test]
    async fn repeated_failures_are_throttled() {
        let manager = manager(2);
        for _ in 0..2 {
            let err = manager
                .authenticate(&password("casuser", "wrong"), "10.0.0.1")
                .await
                .unwrap_err();
            assert_eq!(err, CasError::BadCredentials);
        }
        let err = manager
            .authenticate(&password("casuser", "Mellon"), "10.0.0.1")
            .await
            .unwrap_err();
        assert_eq!(err, CasError::Throttled);

        // another client address is unaffected
        assert!(manager
            .authenticate(&password("casuser", "Mellon"), "10.0.0.2")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unsupported_credential_fails() {
        let credential = Credential::Delegated {
            client_name: "upstream".to_string(),
            assertion: SecretString::from("x".to_string()),
        };
        let err = manager(5)
            .authenticate(&credential, "10.0.0.1")
            .await
            .unwrap_err();
        assert_eq!(err, CasError::AuthenticationFailed);
    }

    #[test]
    fn renewal_strictly_advances_auth_time() {
        let first = Authentication::new(Principal::new("casuser"), "t", "h", "pwd");
        let second = Authentication::new(Principal::new("casuser"), "t", "h", "pwd")
            .renewed_after(first.auth_time);
        assert!(second.auth_time > first.auth_time);
    }

    #[test]
    fn mfa_changes_context_class() {
        let authentication = Authentication::new(Principal::new("casuser"), "t", "h", "pwd")
            .with_mfa("mfa-gauth", "GoogleAuthenticatorAuthenticationHandler");
        assert!(authentication.is_mfa());
        assert_eq!(authentication.context_class, ACR_MFA);
        let attributes = authentication.attributes(true);
        assert_eq!(attributes["authenticationContext"], vec!["mfa-gauth"]);
        assert_eq!(attributes["authnContextClass"], vec![ACR_MFA]);
        assert_eq!(attributes["isFromNewLogin"], vec!["true"]);
    }

    #[test]
    fn credential_debug_redacts_secrets() {
        let rendered = format!("{:?}", password("casuser", "Mellon"));
        assert!(!rendered.contains("Mellon"));
    }
}
