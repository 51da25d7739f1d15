//! Runtime configuration of the server, assembled by the CLI.

use secrecy::SecretString;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use crate::{
    engine::ConcurrentSessionPolicy,
    principal::MergeStrategy,
    tickets::{ExpirationPolicies, retry::RetryPolicy},
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PREFIX: &str = "http://localhost:8080";
pub const DEFAULT_GAUTH_ISSUER: &str = "Tessera";

/// Upstream identity provider for delegated authentication, read from the delegated
/// clients file.
#[derive(Clone, Debug, Deserialize)]
pub struct DelegatedClient {
    pub client_name: String,
    pub issuer: String,
    pub audience: String,
    pub secret: SecretString,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    port: u16,
    dsn: Option<SecretString>,
    server_prefix: String,
    services_file: Option<PathBuf>,
    accounts_file: Option<PathBuf>,
    delegated_clients_file: Option<PathBuf>,
    policies: ExpirationPolicies,
    concurrent_session_policy: ConcurrentSessionPolicy,
    sso_excluded_principals: Vec<String>,
    attribute_merge_strategy: MergeStrategy,
    mfa_global_provider: Option<String>,
    trusted_devices: bool,
    gauth_issuer: String,
    duo_verify_url: Option<String>,
    external_timeout: Duration,
    cookie_key: Option<SecretString>,
    flow_key: Option<SecretString>,
    ticket_signing_key: Option<SecretString>,
    ticket_encryption_key: Option<SecretString>,
    ticket_suffix: Option<String>,
    oidc_issuer: Option<String>,
    oidc_signing_secret: Option<SecretString>,
    oidc_signing_key_path: Option<PathBuf>,
    saml_entity_id: Option<String>,
    saml_signing_key_path: Option<PathBuf>,
    retry: RetryPolicy,
    reaper_interval: Duration,
    throttle_failure_threshold: u32,
    throttle_window: Duration,
    trust_forwarded_headers: bool,
    actuator_token: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            dsn: None,
            server_prefix: DEFAULT_PREFIX.to_string(),
            services_file: None,
            accounts_file: None,
            delegated_clients_file: None,
            policies: ExpirationPolicies::default(),
            concurrent_session_policy: ConcurrentSessionPolicy::default(),
            sso_excluded_principals: Vec::new(),
            attribute_merge_strategy: MergeStrategy::default(),
            mfa_global_provider: None,
            trusted_devices: false,
            gauth_issuer: DEFAULT_GAUTH_ISSUER.to_string(),
            duo_verify_url: None,
            external_timeout: Duration::from_secs(5),
            cookie_key: None,
            flow_key: None,
            ticket_signing_key: None,
            ticket_encryption_key: None,
            ticket_suffix: None,
            oidc_issuer: None,
            oidc_signing_secret: None,
            oidc_signing_key_path: None,
            saml_entity_id: None,
            saml_signing_key_path: None,
            retry: RetryPolicy::default(),
            reaper_interval: Duration::from_secs(120),
            throttle_failure_threshold: 5,
            throttle_window: Duration::from_secs(300),
            trust_forwarded_headers: false,
            actuator_token: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_dsn(mut self, dsn: Option<SecretString>) -> Self {
        self.dsn = dsn;
        self
    }

    #[must_use]
    pub fn with_server_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.server_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_services_file(mut self, path: Option<PathBuf>) -> Self {
        self.services_file = path;
        self
    }

    #[must_use]
    pub fn with_accounts_file(mut self, path: Option<PathBuf>) -> Self {
        self.accounts_file = path;
        self
    }

    #[must_use]
    pub fn with_delegated_clients_file(mut self, path: Option<PathBuf>) -> Self {
        self.delegated_clients_file = path;
        self
    }

    #[must_use]
    pub fn with_policies(mut self, policies: ExpirationPolicies) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub const fn with_concurrent_session_policy(mut self, policy: ConcurrentSessionPolicy) -> Self {
        self.concurrent_session_policy = policy;
        self
    }

    #[must_use]
    pub fn with_sso_excluded_principals(mut self, principals: Vec<String>) -> Self {
        self.sso_excluded_principals = principals;
        self
    }

    #[must_use]
    pub const fn with_attribute_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.attribute_merge_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_mfa_global_provider(mut self, provider: Option<String>) -> Self {
        self.mfa_global_provider = provider.filter(|p| !p.trim().is_empty());
        self
    }

    #[must_use]
    pub const fn with_trusted_devices(mut self, enabled: bool) -> Self {
        self.trusted_devices = enabled;
        self
    }

    #[must_use]
    pub fn with_gauth_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.gauth_issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_duo_verify_url(mut self, url: Option<String>) -> Self {
        self.duo_verify_url = url;
        self
    }

    #[must_use]
    pub const fn with_external_timeout(mut self, timeout: Duration) -> Self {
        self.external_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cookie_key(mut self, key: Option<SecretString>) -> Self {
        self.cookie_key = key;
        self
    }

    #[must_use]
    pub fn with_flow_key(mut self, key: Option<SecretString>) -> Self {
        self.flow_key = key;
        self
    }

    #[must_use]
    pub fn with_ticket_signing_key(mut self, key: Option<SecretString>) -> Self {
        self.ticket_signing_key = key;
        self
    }

    #[must_use]
    pub fn with_ticket_encryption_key(mut self, key: Option<SecretString>) -> Self {
        self.ticket_encryption_key = key;
        self
    }

    #[must_use]
    pub fn with_ticket_suffix(mut self, suffix: Option<String>) -> Self {
        self.ticket_suffix = suffix;
        self
    }

    #[must_use]
    pub fn with_oidc_issuer(mut self, issuer: Option<String>) -> Self {
        self.oidc_issuer = issuer.map(|issuer| issuer.trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn with_oidc_signing_secret(mut self, secret: Option<SecretString>) -> Self {
        self.oidc_signing_secret = secret;
        self
    }

    #[must_use]
    pub fn with_oidc_signing_key_path(mut self, path: Option<PathBuf>) -> Self {
        self.oidc_signing_key_path = path;
        self
    }

    #[must_use]
    pub fn with_saml_entity_id(mut self, entity_id: Option<String>) -> Self {
        self.saml_entity_id = entity_id;
        self
    }

    #[must_use]
    pub fn with_saml_signing_key_path(mut self, path: Option<PathBuf>) -> Self {
        self.saml_signing_key_path = path;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_throttle(mut self, failure_threshold: u32, window: Duration) -> Self {
        self.throttle_failure_threshold = failure_threshold;
        self.throttle_window = window;
        self
    }

    /// Take the client address from `X-Forwarded-For` instead of the TCP peer. Only
    /// safe behind a proxy that overwrites the header.
    #[must_use]
    pub const fn with_trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Bearer token required by `/actuator` endpoints.
    #[must_use]
    pub fn with_actuator_token(mut self, token: Option<SecretString>) -> Self {
        self.actuator_token = token;
        self
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn dsn(&self) -> Option<&SecretString> {
        self.dsn.as_ref()
    }

    #[must_use]
    pub fn server_prefix(&self) -> &str {
        &self.server_prefix
    }

    #[must_use]
    pub const fn services_file(&self) -> Option<&PathBuf> {
        self.services_file.as_ref()
    }

    #[must_use]
    pub const fn accounts_file(&self) -> Option<&PathBuf> {
        self.accounts_file.as_ref()
    }

    #[must_use]
    pub const fn delegated_clients_file(&self) -> Option<&PathBuf> {
        self.delegated_clients_file.as_ref()
    }

    #[must_use]
    pub const fn policies(&self) -> &ExpirationPolicies {
        &self.policies
    }

    #[must_use]
    pub const fn concurrent_session_policy(&self) -> ConcurrentSessionPolicy {
        self.concurrent_session_policy
    }

    #[must_use]
    pub fn sso_excluded_principals(&self) -> &[String] {
        &self.sso_excluded_principals
    }

    #[must_use]
    pub const fn attribute_merge_strategy(&self) -> MergeStrategy {
        self.attribute_merge_strategy
    }

    #[must_use]
    pub fn mfa_global_provider(&self) -> Option<&str> {
        self.mfa_global_provider.as_deref()
    }

    #[must_use]
    pub const fn trusted_devices(&self) -> bool {
        self.trusted_devices
    }

    #[must_use]
    pub fn gauth_issuer(&self) -> &str {
        &self.gauth_issuer
    }

    #[must_use]
    pub fn duo_verify_url(&self) -> Option<&str> {
        self.duo_verify_url.as_deref()
    }

    #[must_use]
    pub const fn external_timeout(&self) -> Duration {
        self.external_timeout
    }

    #[must_use]
    pub const fn cookie_key(&self) -> Option<&SecretString> {
        self.cookie_key.as_ref()
    }

    #[must_use]
    pub const fn flow_key(&self) -> Option<&SecretString> {
        self.flow_key.as_ref()
    }

    #[must_use]
    pub const fn ticket_signing_key(&self) -> Option<&SecretString> {
        self.ticket_signing_key.as_ref()
    }

    #[must_use]
    pub const fn ticket_encryption_key(&self) -> Option<&SecretString> {
        self.ticket_encryption_key.as_ref()
    }

    #[must_use]
    pub fn ticket_suffix(&self) -> Option<&str> {
        self.ticket_suffix.as_deref()
    }

    /// Explicit issuer, or `<prefix>/oidc`.
    #[must_use]
    pub fn oidc_issuer(&self) -> String {
        self.oidc_issuer
            .clone()
            .unwrap_or_else(|| format!("{}/oidc", self.server_prefix))
    }

    #[must_use]
    pub const fn oidc_signing_secret(&self) -> Option<&SecretString> {
        self.oidc_signing_secret.as_ref()
    }

    #[must_use]
    pub const fn oidc_signing_key_path(&self) -> Option<&PathBuf> {
        self.oidc_signing_key_path.as_ref()
    }

    /// Explicit entity id, or `<prefix>/idp`.
    #[must_use]
    pub fn saml_entity_id(&self) -> String {
        self.saml_entity_id
            .clone()
            .unwrap_or_else(|| format!("{}/idp", self.server_prefix))
    }

    #[must_use]
    pub const fn saml_signing_key_path(&self) -> Option<&PathBuf> {
        self.saml_signing_key_path.as_ref()
    }

    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        self.retry
    }

    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        self.reaper_interval
    }

    #[must_use]
    pub const fn throttle_failure_threshold(&self) -> u32 {
        self.throttle_failure_threshold
    }

    #[must_use]
    pub const fn throttle_window(&self) -> Duration {
        self.throttle_window
    }

    #[must_use]
    pub const fn trust_forwarded_headers(&self) -> bool {
        self.trust_forwarded_headers
    }

    #[must_use]
    pub const fn actuator_token(&self) -> Option<&SecretString> {
        self.actuator_token.as_ref()
    }

    /// Cookies get `Secure` only when the server is reached over https.
    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.server_prefix.starts_with("https://")
    }
}
