//! Registered services: which relying parties may use the server and what they receive.

pub mod policy;

use anyhow::{Context, Result};
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};
use tracing::debug;

pub use self::policy::{AccessStrategy, AttributeReleasePolicy, ProxyPolicy};

const fn enabled() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OidcSettings {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: Option<SecretString>,
    /// Regex every presented `redirect_uri` must match.
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    /// Custom scope name to the claims it releases.
    #[serde(default)]
    pub custom_scopes: BTreeMap<String, Vec<String>>,
    /// Claim name to the principal attribute it is read from.
    #[serde(default)]
    pub claim_mappings: BTreeMap<String, String>,
    #[serde(default)]
    pub generate_refresh_token: bool,
    #[serde(default)]
    pub bypass_approval: bool,
    /// Attributes of the client-as-principal in the `client_credentials` grant.
    #[serde(default)]
    pub client_attributes: BTreeMap<String, Vec<String>>,
}

impl OidcSettings {
    #[must_use]
    pub fn redirect_uri_matches(&self, redirect_uri: &str) -> bool {
        Regex::new(&format!("^(?:{})$", self.redirect_uri))
            .is_ok_and(|regex| regex.is_match(redirect_uri))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamlSettings {
    pub entity_id: String,
    pub acs_url: String,
    /// Attribute used for `NameID`; the principal id when absent.
    #[serde(default)]
    pub name_id_attribute: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisteredService {
    pub id: u64,
    pub name: String,
    /// Regex matched against the full service URL.
    pub service_id: String,
    #[serde(default)]
    pub evaluation_order: i32,
    #[serde(default)]
    pub access_strategy: AccessStrategy,
    #[serde(default)]
    pub attribute_release: AttributeReleasePolicy,
    #[serde(default = "enabled")]
    pub release_authentication_attributes: bool,
    #[serde(default)]
    pub mfa_providers: Vec<String>,
    #[serde(default)]
    pub jwt_service_ticket: bool,
    #[serde(default)]
    pub proxy_policy: ProxyPolicy,
    #[serde(default)]
    pub oidc: Option<OidcSettings>,
    #[serde(default)]
    pub saml: Option<SamlSettings>,
    #[serde(skip)]
    pattern: Option<Regex>,
}

impl RegisteredService {
    /// Build a service matching `service_id`, with default policies.
    ///
    /// # Errors
    /// Returns an error if `service_id` is not a valid regex.
    pub fn new(id: u64, name: impl Into<String>, service_id: impl Into<String>) -> Result<Self> {
        let mut service = Self {
            id,
            name: name.into(),
            service_id: service_id.into(),
            evaluation_order: 0,
            access_strategy: AccessStrategy::default(),
            attribute_release: AttributeReleasePolicy::default(),
            release_authentication_attributes: true,
            mfa_providers: Vec::new(),
            jwt_service_ticket: false,
            proxy_policy: ProxyPolicy::default(),
            oidc: None,
            saml: None,
            pattern: None,
        };
        service.compile()?;
        Ok(service)
    }

    fn compile(&mut self) -> Result<()> {
        let regex = Regex::new(&format!("^(?:{})$", self.service_id))
            .with_context(|| format!("invalid service_id pattern for service {}", self.id))?;
        self.pattern = Some(regex);
        Ok(())
    }

    #[must_use]
    pub fn matches(&self, service: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(service))
    }

    #[must_use]
    pub fn with_evaluation_order(mut self, order: i32) -> Self {
        self.evaluation_order = order;
        self
    }

    #[must_use]
    pub fn with_access_strategy(mut self, strategy: AccessStrategy) -> Self {
        self.access_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_attribute_release(mut self, policy: AttributeReleasePolicy) -> Self {
        self.attribute_release = policy;
        self
    }

    #[must_use]
    pub fn with_mfa_provider(mut self, provider: impl Into<String>) -> Self {
        self.mfa_providers.push(provider.into());
        self
    }

    #[must_use]
    pub fn with_jwt_service_ticket(mut self, enabled: bool) -> Self {
        self.jwt_service_ticket = enabled;
        self
    }

    #[must_use]
    pub fn with_proxy_policy(mut self, policy: ProxyPolicy) -> Self {
        self.proxy_policy = policy;
        self
    }

    #[must_use]
    pub fn with_oidc(mut self, settings: OidcSettings) -> Self {
        self.oidc = Some(settings);
        self
    }

    #[must_use]
    pub fn with_saml(mut self, settings: SamlSettings) -> Self {
        self.saml = Some(settings);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<RegisteredService>,
}

impl ServiceRegistry {
    /// # Errors
    /// Returns an error if a service pattern does not compile.
    pub fn new(services: Vec<RegisteredService>) -> Result<Self> {
        let mut services = services;
        for service in &mut services {
            if service.pattern.is_none() {
                service.compile()?;
            }
        }
        services.sort_by_key(|service| (service.evaluation_order, service.id));
        Ok(Self { services })
    }

    /// Parse a JSON array of services.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or a pattern does not compile.
    pub fn from_json(json: &str) -> Result<Self> {
        let services: Vec<RegisteredService> =
            serde_json::from_str(json).context("failed to parse registered services")?;
        Self::new(services)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read services file {}", path.display()))?;
        let registry = Self::from_json(&json)?;
        debug!(
            services = registry.services.len(),
            "loaded registered services from {}",
            path.display()
        );
        Ok(registry)
    }

    /// The matching service with the lowest evaluation order.
    #[must_use]
    pub fn find(&self, service: &str) -> Option<&RegisteredService> {
        self.services.iter().find(|candidate| candidate.matches(service))
    }

    #[must_use]
    pub fn find_by_client_id(&self, client_id: &str) -> Option<&RegisteredService> {
        self.services.iter().find(|candidate| {
            candidate
                .oidc
                .as_ref()
                .is_some_and(|oidc| oidc.client_id == client_id)
        })
    }

    #[must_use]
    pub fn find_by_entity_id(&self, entity_id: &str) -> Option<&RegisteredService> {
        self.services.iter().find(|candidate| {
            candidate
                .saml
                .as_ref()
                .is_some_and(|saml| saml.entity_id == entity_id)
        })
    }

    #[must_use]
    pub fn services(&self) -> &[RegisteredService] {
        &self.services
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SERVICES: &str = r#"[
        {
            "id": 1,
            "name": "catch-all",
            "service_id": "https://.*",
            "evaluation_order": 100
        },
        {
            "id": 2,
            "name": "app",
            "service_id": "https://app\\.example\\.org(/.*)?",
            "evaluation_order": 1,
            "attribute_release": { "type": "return_allowed", "allowed": ["mail"] },
            "mfa_providers": ["mfa-gauth"]
        },
        {
            "id": 3,
            "name": "oidc client",
            "service_id": "https://rp\\.example\\.org/.*",
            "oidc": {
                "client_id": "client",
                "client_secret": "secret",
                "redirect_uri": "https://rp\\.example\\.org/callback",
                "scopes": ["openid", "profile"]
            }
        }
    ]"#;

    #[test]
    fn lowest_evaluation_order_wins() {
        let registry = ServiceRegistry::from_json(SERVICES).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.find("https://app.example.org/home").unwrap().id, 2);
        assert_eq!(registry.find("https://other.example.org").unwrap().id, 1);
        assert!(registry.find("http://insecure.example.org").is_none());
    }

    #[test]
    fn patterns_are_anchored() {
        let service = RegisteredService::new(1, "app", r"https://app\.example\.org").unwrap();
        assert!(service.matches("https://app.example.org"));
        assert!(!service.matches("https://app.example.org.evil.com"));
        assert!(!service.matches("xhttps://app.example.org"));
    }

    #[test]
    fn oidc_lookup_and_redirects() {
        let registry = ServiceRegistry::from_json(SERVICES).unwrap();
        let service = registry.find_by_client_id("client").unwrap();
        let oidc = service.oidc.as_ref().unwrap();
        assert!(oidc.redirect_uri_matches("https://rp.example.org/callback"));
        assert!(!oidc.redirect_uri_matches("https://rp.example.org/callback/other"));
        assert!(registry.find_by_client_id("unknown").is_none());
    }

    #[test]
    fn secrets_are_not_serialized() {
        let registry = ServiceRegistry::from_json(SERVICES).unwrap();
        let json = serde_json::to_string(registry.services()).unwrap();
        assert!(!json.contains("secret\""));
        assert!(json.contains("\"client_id\":\"client\""));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(RegisteredService::new(1, "bad", "https://(").is_err());
        assert!(ServiceRegistry::from_json(r#"[{"id":1,"name":"x","service_id":"("}]"#).is_err());
    }
}
