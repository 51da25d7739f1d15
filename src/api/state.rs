//! Shared server state: every engine and adapter, wired from [`ServerConfig`].

use anyhow::{Context, Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use std::{fmt, fs, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    authn::{
        AuthenticationManager,
        accounts::AccountsAuthenticationHandler,
        delegated::{DelegatedAuthenticationHandler, JwtIdentityProvider},
        throttle::LoginThrottle,
    },
    config::{DelegatedClient, ServerConfig},
    crypto::{KEY_LEN, Sealer, random_bytes},
    engine::{SsoPolicy, TicketEngine},
    mfa::{
        MfaOrchestrator,
        duo::{DuoProvider, DuoVerifier, HttpDuoVerifier},
        flow::FlowCodec,
        gauth::GoogleAuthenticator,
        trusted::TrustedDeviceStore,
    },
    oidc::{OidcProvider, tokens::IdTokenSigner},
    principal::PrincipalResolver,
    registry::{RegisteredService, ServiceRegistry},
    saml::{SamlIdp, signing::SamlSigner},
    tickets::{
        id::TicketIdGenerator,
        postgres::PostgresTicketStore,
        store::{MemoryTicketStore, TicketStore},
    },
    validation::{HttpProxyCallback, ProxyCallback, ServiceValidator, jwt::JwtTicketCodec},
};

/// Pieces loaded from outside the process (store, files).
pub struct Components {
    pub store: Arc<dyn TicketStore>,
    pub registry: ServiceRegistry,
    pub accounts: AccountsAuthenticationHandler,
    pub delegated_clients: Vec<DelegatedClient>,
    /// Delivers proxy-granting tickets; plain HTTPS when unset.
    pub proxy_callback: Option<Arc<dyn ProxyCallback>>,
}

impl Components {
    /// Connect the ticket store and read the services, accounts and delegated clients
    /// files named in `config`.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable or a file cannot be parsed.
    pub async fn load(config: &ServerConfig) -> Result<Self> {
        let store: Arc<dyn TicketStore> = match config.dsn() {
            Some(dsn) => {
                let pool = PgPoolOptions::new()
                    .min_connections(1)
                    .max_connections(10)
                    .max_lifetime(Duration::from_secs(60 * 2))
                    .test_before_acquire(true)
                    .connect(dsn.expose_secret())
                    .await
                    .context("Failed to connect to database")?;
                let store = PostgresTicketStore::new(pool);
                store
                    .migrate()
                    .await
                    .context("Failed to apply ticket store schema")?;
                Arc::new(store)
            }
            None => {
                warn!("No DSN configured, tickets are kept in memory and lost on restart");
                Arc::new(MemoryTicketStore::new())
            }
        };

        let registry = match config.services_file() {
            Some(path) => ServiceRegistry::from_file(path)?,
            None => {
                warn!("No services file configured, every service will be refused");
                ServiceRegistry::new(Vec::new())?
            }
        };

        let accounts = match config.accounts_file() {
            Some(path) => AccountsAuthenticationHandler::from_file(path)?,
            None => AccountsAuthenticationHandler::from_json("{}")?,
        };

        let delegated_clients = match config.delegated_clients_file() {
            Some(path) => {
                let json = fs::read_to_string(path).with_context(|| {
                    format!("Failed to read delegated clients file: {}", path.display())
                })?;
                serde_json::from_str(&json).context("Invalid delegated clients JSON")?
            }
            None => Vec::new(),
        };

        Ok(Self {
            store,
            registry,
            accounts,
            delegated_clients,
            proxy_callback: None,
        })
    }
}

/// 32-byte key from hex, or a random one that only lives as long as the process.
fn symmetric_key(name: &str, value: Option<&SecretString>) -> Result<[u8; KEY_LEN]> {
    match value {
        Some(value) => {
            let bytes = hex::decode(value.expose_secret().trim())
                .map_err(|_| anyhow!("{name} must be hex encoded"))?;
            bytes
                .try_into()
                .map_err(|_| anyhow!("{name} must be {KEY_LEN} bytes"))
        }
        None => {
            warn!("No {name} configured, using a random key for this process");
            Ok(random_bytes::<KEY_LEN>()?)
        }
    }
}

fn id_token_signer(config: &ServerConfig) -> Result<IdTokenSigner> {
    if let Some(path) = config.oidc_signing_key_path() {
        let pem = fs::read_to_string(path)
            .with_context(|| format!("Failed to read OIDC signing key: {}", path.display()))?;
        return IdTokenSigner::rs256_from_pem(&pem);
    }
    if let Some(secret) = config.oidc_signing_secret() {
        return Ok(IdTokenSigner::hs256(
            secret.expose_secret().as_bytes().to_vec(),
        ));
    }
    warn!("No OIDC signing key configured, ID tokens use a random HS256 secret");
    Ok(IdTokenSigner::hs256(random_bytes::<KEY_LEN>()?.to_vec()))
}

fn saml_signer(config: &ServerConfig) -> Result<SamlSigner> {
    if let Some(path) = config.saml_signing_key_path() {
        let pem = fs::read_to_string(path)
            .with_context(|| format!("Failed to read SAML signing key: {}", path.display()))?;
        return SamlSigner::from_pem(&pem);
    }
    warn!("No SAML signing key configured, generating one for this process");
    SamlSigner::generate()
}

pub struct AppState {
    config: ServerConfig,
    engine: Arc<TicketEngine>,
    registry: Arc<ServiceRegistry>,
    authn: AuthenticationManager,
    mfa: MfaOrchestrator,
    validator: ServiceValidator,
    codec: Arc<JwtTicketCodec>,
    oidc: OidcProvider,
    saml: SamlIdp,
    cookies: Sealer,
    delegated_clients: Vec<String>,
}

impl AppState {
    /// Load external components and wire the server.
    ///
    /// # Errors
    /// Returns an error if a component cannot be loaded or a key is invalid.
    pub async fn from_config(config: ServerConfig) -> Result<Self> {
        let components = Components::load(&config).await?;
        Self::build(config, components)
    }

    /// Wire the server from already loaded components.
    ///
    /// # Errors
    /// Returns an error if a key is invalid or an HTTP client cannot be built.
    pub fn build(config: ServerConfig, components: Components) -> Result<Self> {
        let Components {
            store,
            registry,
            accounts,
            delegated_clients,
            proxy_callback,
        } = components;

        let mut sso = SsoPolicy::new().with_concurrent(config.concurrent_session_policy());
        for principal in config.sso_excluded_principals() {
            sso = sso.with_excluded_principal(principal.clone());
        }
        let engine = Arc::new(
            TicketEngine::new(store)
                .with_ids(TicketIdGenerator::new(
                    config.ticket_suffix().map(str::to_string),
                ))
                .with_policies(config.policies().clone())
                .with_sso(sso)
                .with_retry(config.retry()),
        );
        let registry = Arc::new(registry);

        let throttle = Arc::new(LoginThrottle::new(
            config.throttle_failure_threshold(),
            config.throttle_window(),
        ));
        let mut delegated = DelegatedAuthenticationHandler::new(config.external_timeout());
        for client in delegated_clients {
            delegated = delegated.with_provider(Arc::new(JwtIdentityProvider::new(
                client.client_name,
                client.issuer,
                client.audience,
                client.secret,
            )));
        }
        let delegated_clients = delegated.client_names();
        let authn = AuthenticationManager::new(
            PrincipalResolver::new(config.attribute_merge_strategy()),
            throttle,
        )
        .with_handler(Arc::new(accounts))
        .with_handler(Arc::new(delegated));

        let flow_sealer = Arc::new(Sealer::new(symmetric_key(
            "flow key",
            config.flow_key(),
        )?));
        let gauth = Arc::new(GoogleAuthenticator::new(
            config.gauth_issuer(),
            flow_sealer.clone(),
        ));
        let mut mfa = MfaOrchestrator::new(gauth, FlowCodec::new(flow_sealer))
            .with_global_provider(config.mfa_global_provider().map(str::to_string));
        if let Some(url) = config.duo_verify_url() {
            let verifier: Arc<dyn DuoVerifier> = Arc::new(HttpDuoVerifier::new(url)?);
            mfa = mfa.with_duo(Arc::new(DuoProvider::new(
                Some(verifier),
                config.external_timeout(),
            )));
        }
        if config.trusted_devices() {
            mfa = mfa.with_trusted_devices(Arc::new(TrustedDeviceStore::new()));
        }

        let signing_key = match config.ticket_signing_key() {
            Some(key) => hex::decode(key.expose_secret().trim())
                .map_err(|_| anyhow!("ticket signing key must be hex encoded"))?,
            None => {
                warn!("No ticket signing key configured, using a random key for this process");
                random_bytes::<64>()?.to_vec()
            }
        };
        let codec = Arc::new(JwtTicketCodec::new(
            config.server_prefix(),
            signing_key,
            symmetric_key("ticket encryption key", config.ticket_encryption_key())?,
        ));
        let proxy_callback: Arc<dyn ProxyCallback> = match proxy_callback {
            Some(callback) => callback,
            None => Arc::new(HttpProxyCallback::new(config.external_timeout())?),
        };
        let validator = ServiceValidator::new(
            engine.clone(),
            registry.clone(),
            codec.clone(),
            proxy_callback,
        );

        let token_ttl = config.policies().access_token.time_to_live_seconds();
        let mut oidc = OidcProvider::new(
            config.oidc_issuer(),
            engine.clone(),
            registry.clone(),
            Arc::new(id_token_signer(&config)?),
        );
        if let Some(ttl) = token_ttl {
            oidc = oidc.with_id_token_ttl(ttl);
        }
        let saml = SamlIdp::new(
            config.saml_entity_id(),
            config.server_prefix(),
            engine.clone(),
            registry.clone(),
            Arc::new(saml_signer(&config)?),
        );
        let cookies = Sealer::new(symmetric_key("cookie key", config.cookie_key())?);

        info!(
            services = registry.len(),
            store = engine.store().name(),
            policy = %config.concurrent_session_policy(),
            "server state ready"
        );
        Ok(Self {
            config,
            engine,
            registry,
            authn,
            mfa,
            validator,
            codec,
            oidc,
            saml,
            cookies,
            delegated_clients,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &TicketEngine {
        &self.engine
    }

    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn authn(&self) -> &AuthenticationManager {
        &self.authn
    }

    #[must_use]
    pub const fn mfa(&self) -> &MfaOrchestrator {
        &self.mfa
    }

    #[must_use]
    pub const fn validator(&self) -> &ServiceValidator {
        &self.validator
    }

    #[must_use]
    pub fn codec(&self) -> &JwtTicketCodec {
        &self.codec
    }

    #[must_use]
    pub const fn oidc(&self) -> &OidcProvider {
        &self.oidc
    }

    #[must_use]
    pub const fn saml(&self) -> &SamlIdp {
        &self.saml
    }

    #[must_use]
    pub const fn cookies(&self) -> &Sealer {
        &self.cookies
    }

    #[must_use]
    pub fn delegated_clients(&self) -> &[String] {
        &self.delegated_clients
    }

    /// Registered service for a CAS `service` parameter. OIDC authorize and SAML callback
    /// URLs resolve to the client or SP they belong to.
    #[must_use]
    pub fn resolve_service(&self, service: &str) -> Option<&RegisteredService> {
        let authorize = format!("{}?", self.oidc.authorize_endpoint());
        if service.starts_with(&authorize) {
            let client_id = url::Url::parse(service).ok().and_then(|url| {
                url.query_pairs()
                    .find(|(name, _)| name == "client_id")
                    .map(|(_, value)| value.into_owned())
            })?;
            return self.registry.find_by_client_id(&client_id);
        }
        self.saml
            .service_for_callback(service)
            .or_else(|| self.registry.find(service))
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("prefix", &self.config.server_prefix())
            .field("store", &self.engine.store().name())
            .field("services", &self.registry.len())
            .field("delegated_clients", &self.delegated_clients)
            .finish_non_exhaustive()
    }
}
