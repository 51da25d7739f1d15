//! OAuth2 / OpenID Connect adapter.
//!
//! Codes and tokens are tickets granted from the user's TGT, so they live and die with the
//! SSO session. Authorization requests that need a (fresh) login bounce through `/login`
//! with the authorize URL itself as the CAS service and come back carrying a service
//! ticket.

pub mod claims;
pub mod tokens;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::{collections::BTreeSet, fmt, sync::Arc};
use tracing::{debug, info, instrument};
use ulid::Ulid;
use url::{Url, form_urlencoded};
use utoipa::{IntoParams, ToSchema};

use crate::{
    authn::{ACR_MFA, Authentication, CREDENTIAL_OAUTH_CLIENT},
    crypto::constant_time_eq,
    engine::TicketEngine,
    error::CasError,
    mfa,
    principal::Principal,
    registry::{OidcSettings, RegisteredService, ServiceRegistry},
    tickets::{TicketData, TicketKind},
    validation::services_match,
};

use self::{
    claims::{SCOPE_OPENID, granted_scopes, resolve_claims, scope_string},
    tokens::{IdTokenSigner, at_hash, verify_pkce},
};

pub const CLIENT_HANDLER: &str = "OAuthClientAuthenticationHandler";
const DEFAULT_TOKEN_TTL_SECONDS: i64 = 28_800;
const RESERVED_CLAIMS: [&str; 12] = [
    "iss", "aud", "sub", "exp", "iat", "jti", "auth_time", "nonce", "client_id", "acr", "amr",
    "at_hash",
];

#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub max_age: Option<i64>,
    pub prompt: Option<String>,
    pub acr_values: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// Service ticket handed back by `/login`.
    pub ticket: Option<String>,
}

impl AuthorizeRequest {
    fn forces_login(&self) -> bool {
        self.max_age.is_some()
            || self
                .prompt
                .as_deref()
                .is_some_and(|prompt| prompt.split_whitespace().any(|p| p == "login"))
    }

    fn requested_contexts(&self) -> Vec<String> {
        self.acr_values
            .as_deref()
            .map(|values| values.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    /// Send the browser to `/login` with `service` as the CAS service.
    Login {
        service: String,
        renew: bool,
        requested_contexts: Vec<String>,
    },
    /// Redirect back to the client.
    Redirect(String),
}

#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

/// Map ticket failures on codes and tokens to `invalid_grant`.
fn invalid_grant(err: CasError) -> CasError {
    match err {
        CasError::TicketNotFound(id)
        | CasError::TicketExpired(id)
        | CasError::TicketAlreadyConsumed(id) => {
            CasError::InvalidGrant(format!("{id} is not valid"))
        }
        other => other,
    }
}

pub struct OidcProvider {
    issuer: String,
    engine: Arc<TicketEngine>,
    registry: Arc<ServiceRegistry>,
    signer: Arc<IdTokenSigner>,
    id_token_ttl_seconds: i64,
}

impl OidcProvider {
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        engine: Arc<TicketEngine>,
        registry: Arc<ServiceRegistry>,
        signer: Arc<IdTokenSigner>,
    ) -> Self {
        Self {
            issuer: issuer.into().trim_end_matches('/').to_string(),
            engine,
            registry,
            signer,
            id_token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_id_token_ttl(mut self, seconds: i64) -> Self {
        self.id_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn authorize_endpoint(&self) -> String {
        format!("{}/authorize", self.issuer)
    }

    fn client(&self, client_id: &str) -> Result<(&RegisteredService, &OidcSettings), CasError> {
        let registered = self
            .registry
            .find_by_client_id(client_id)
            .ok_or(CasError::InvalidClient)?;
        let settings = registered.oidc.as_ref().ok_or(CasError::InvalidClient)?;
        Ok((registered, settings))
    }

    /// The authorize URL that `/login` returns to. Built from the request in a fixed
    /// order so the service ticket's service compares equal on the way back.
    #[must_use]
    pub fn callback_url(&self, request: &AuthorizeRequest) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("client_id", &request.client_id);
        let max_age = request.max_age.map(|age| age.to_string());
        let optional = [
            ("redirect_uri", request.redirect_uri.as_deref()),
            ("response_type", request.response_type.as_deref()),
            ("scope", request.scope.as_deref()),
            ("state", request.state.as_deref()),
            ("nonce", request.nonce.as_deref()),
            ("max_age", max_age.as_deref()),
            ("prompt", request.prompt.as_deref()),
            ("acr_values", request.acr_values.as_deref()),
            ("code_challenge", request.code_challenge.as_deref()),
            ("code_challenge_method", request.code_challenge_method.as_deref()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                query.append_pair(name, value);
            }
        }
        format!("{}?{}", self.authorize_endpoint(), query.finish())
    }

    /// Handle `/oidc/authorize`. `session` is the TGT from the caller's `TGC` cookie.
    ///
    /// # Errors
    /// `InvalidClient` / `InvalidRedirectUri` (never redirected to the client), or a
    /// store failure. Other failures are redirected to the client as `error=`.
    #[instrument(skip_all, fields(client_id = %request.client_id))]
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        session: Option<&str>,
    ) -> Result<AuthorizeOutcome, CasError> {
        let (registered, settings) = self.client(&request.client_id)?;
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| CasError::InvalidRequest("redirect_uri is required".to_string()))?;
        if !settings.redirect_uri_matches(redirect_uri) {
            return Err(CasError::InvalidRedirectUri);
        }

        match self
            .authorize_client(request, registered, settings, redirect_uri, session)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_retryable() || matches!(err, CasError::Internal(_)) => Err(err),
            Err(err) => {
                debug!("authorization request refused: {err}");
                Ok(AuthorizeOutcome::Redirect(error_redirect(
                    redirect_uri,
                    &err,
                    request.state.as_deref(),
                )?))
            }
        }
    }

    async fn authorize_client(
        &self,
        request: &AuthorizeRequest,
        registered: &RegisteredService,
        settings: &OidcSettings,
        redirect_uri: &str,
        session: Option<&str>,
    ) -> Result<AuthorizeOutcome, CasError> {
        if request.response_type.as_deref() != Some("code") {
            return Err(CasError::UnsupportedResponseType);
        }
        let scopes = granted_scopes(request.scope.as_deref().unwrap_or(SCOPE_OPENID), settings)?;
        if let Some(method) = request.code_challenge_method.as_deref() {
            if !matches!(method, "plain" | "S256") {
                return Err(CasError::InvalidRequest(format!(
                    "unsupported code_challenge_method {method}"
                )));
            }
        }
        let forced = request.forces_login();
        let contexts = request.requested_contexts();

        if let Some(ticket) = &request.ticket {
            let validated = self.engine.consume(ticket, &[TicketKind::Service]).await?;
            let callback = self.callback_url(request);
            let (issued_for, from_new_login) = match &validated.ticket.data {
                TicketData::Service {
                    service,
                    from_new_login,
                } => (service.as_str(), *from_new_login),
                _ => return Err(CasError::InvalidTicketSpec(ticket.clone())),
            };
            if !services_match(issued_for, &callback) {
                return Err(CasError::ServiceMismatch);
            }
            if forced && !from_new_login {
                return Err(CasError::TicketNotFromNewLogin(ticket.clone()));
            }
            if !mfa::is_satisfied(registered, &contexts, &validated.authentication) {
                return Err(CasError::MfaFailed);
            }
            let tgt_id = validated
                .ticket
                .granting_ticket_id
                .clone()
                .ok_or_else(|| CasError::Internal(format!("{ticket} has no session")))?;
            return self
                .issue_code(request, settings, redirect_uri, &tgt_id, &validated.ticket.principal_id, scopes)
                .await;
        }

        if let Some(tgt_id) = session {
            if let Ok(tgt) = self
                .engine
                .find_usable(tgt_id, TicketKind::TicketGranting)
                .await
            {
                let participates = self
                    .engine
                    .sso()
                    .participates(&tgt.ticket.principal_id, Some(registered));
                if !forced
                    && participates
                    && mfa::is_satisfied(registered, &contexts, &tgt.authentication)
                {
                    registered
                        .access_strategy
                        .authorize(&tgt.authentication.principal)?;
                    return self
                        .issue_code(request, settings, redirect_uri, tgt_id, &tgt.ticket.principal_id, scopes)
                        .await;
                }
            }
        }

        Ok(AuthorizeOutcome::Login {
            service: self.callback_url(request),
            renew: forced,
            requested_contexts: contexts,
        })
    }

    async fn issue_code(
        &self,
        request: &AuthorizeRequest,
        settings: &OidcSettings,
        redirect_uri: &str,
        tgt_id: &str,
        principal_id: &str,
        scopes: BTreeSet<String>,
    ) -> Result<AuthorizeOutcome, CasError> {
        let code = self
            .engine
            .issue(
                TicketKind::OAuthCode,
                Some(tgt_id),
                principal_id,
                TicketData::OAuthCode {
                    client_id: settings.client_id.clone(),
                    redirect_uri: redirect_uri.to_string(),
                    scopes,
                    nonce: request.nonce.clone(),
                    code_challenge: request.code_challenge.clone(),
                    code_challenge_method: request.code_challenge_method.clone(),
                },
            )
            .await?;
        let mut url = Url::parse(redirect_uri).map_err(|_| CasError::InvalidRedirectUri)?;
        url.query_pairs_mut().append_pair("code", &code.id);
        if let Some(state) = &request.state {
            url.query_pairs_mut().append_pair("state", state);
        }
        info!(client_id = %settings.client_id, "issued authorization code");
        Ok(AuthorizeOutcome::Redirect(url.to_string()))
    }

    /// Resolve and authenticate the calling client. Returns whether a secret was checked.
    fn authenticate_client(
        &self,
        request: &TokenRequest,
        basic: Option<(String, String)>,
    ) -> Result<(&RegisteredService, &OidcSettings, bool), CasError> {
        let (client_id, presented) = match basic {
            Some((id, secret)) => (id, Some(secret)),
            None => (
                request.client_id.clone().ok_or(CasError::InvalidClient)?,
                request.client_secret.clone(),
            ),
        };
        let (registered, settings) = self.client(&client_id)?;
        match &settings.client_secret {
            Some(expected) => {
                let presented = presented.ok_or(CasError::InvalidClient)?;
                if !constant_time_eq(
                    secrecy::ExposeSecret::expose_secret(expected).as_bytes(),
                    presented.as_bytes(),
                ) {
                    return Err(CasError::InvalidClient);
                }
                Ok((registered, settings, true))
            }
            None => Ok((registered, settings, false)),
        }
    }

    /// Handle `/oidc/token`.
    ///
    /// # Errors
    /// `InvalidClient`, `InvalidGrant`, `UnsupportedGrantType`, `InvalidScope`.
    #[instrument(skip_all, fields(grant_type = %request.grant_type))]
    pub async fn token(
        &self,
        request: &TokenRequest,
        basic: Option<(String, String)>,
    ) -> Result<TokenResponse, CasError> {
        let (registered, settings, confidential) = self.authenticate_client(request, basic)?;
        match request.grant_type.as_str() {
            "authorization_code" => {
                let code = request
                    .code
                    .as_deref()
                    .ok_or_else(|| CasError::InvalidRequest("code is required".to_string()))?;
                let validated = self
                    .engine
                    .consume(code, &[TicketKind::OAuthCode])
                    .await
                    .map_err(invalid_grant)?;
                let TicketData::OAuthCode {
                    client_id,
                    redirect_uri,
                    scopes,
                    nonce,
                    code_challenge,
                    code_challenge_method,
                } = &validated.ticket.data
                else {
                    return Err(CasError::InvalidGrant(format!("{code} is not a code")));
                };
                if client_id != &settings.client_id {
                    return Err(CasError::InvalidGrant(
                        "code was issued to another client".to_string(),
                    ));
                }
                if request.redirect_uri.as_deref() != Some(redirect_uri.as_str()) {
                    return Err(CasError::InvalidGrant("redirect_uri mismatch".to_string()));
                }
                match code_challenge {
                    Some(challenge) => {
                        let verifier = request.code_verifier.as_deref().unwrap_or_default();
                        if !verify_pkce(challenge, code_challenge_method.as_deref(), verifier) {
                            return Err(CasError::InvalidGrant(
                                "code_verifier does not match".to_string(),
                            ));
                        }
                    }
                    None if !confidential => return Err(CasError::InvalidClient),
                    None => {}
                }
                registered
                    .access_strategy
                    .authorize(&validated.authentication.principal)?;
                self.issue_tokens(
                    settings,
                    &validated.authentication,
                    scopes.clone(),
                    nonce.as_deref(),
                    validated.ticket.granting_ticket_id.as_deref(),
                    true,
                )
                .await
            }
            "client_credentials" => {
                if !confidential {
                    return Err(CasError::InvalidClient);
                }
                let scopes = match request.scope.as_deref() {
                    Some(scope) => granted_scopes(scope, settings)?,
                    None => BTreeSet::new(),
                };
                let mut principal = Principal::new(settings.client_id.clone());
                principal
                    .attributes
                    .extend(settings.client_attributes.clone());
                let authentication =
                    Authentication::new(principal, CREDENTIAL_OAUTH_CLIENT, CLIENT_HANDLER, "client");
                self.issue_tokens(settings, &authentication, scopes, None, None, false)
                    .await
            }
            "refresh_token" => {
                let token = request.refresh_token.as_deref().ok_or_else(|| {
                    CasError::InvalidRequest("refresh_token is required".to_string())
                })?;
                let validated = self
                    .engine
                    .find_usable(token, TicketKind::RefreshToken)
                    .await
                    .map_err(invalid_grant)?;
                let TicketData::RefreshToken {
                    client_id, scopes, ..
                } = &validated.ticket.data
                else {
                    return Err(CasError::InvalidGrant(format!("{token} is not a refresh token")));
                };
                if client_id != &settings.client_id {
                    return Err(CasError::InvalidGrant(
                        "refresh token was issued to another client".to_string(),
                    ));
                }
                self.issue_tokens(
                    settings,
                    &validated.authentication,
                    scopes.clone(),
                    None,
                    validated.ticket.granting_ticket_id.as_deref(),
                    false,
                )
                .await
            }
            _ => Err(CasError::UnsupportedGrantType),
        }
    }

    async fn issue_tokens(
        &self,
        settings: &OidcSettings,
        authentication: &Authentication,
        scopes: BTreeSet<String>,
        nonce: Option<&str>,
        tgt_id: Option<&str>,
        with_refresh: bool,
    ) -> Result<TokenResponse, CasError> {
        let principal_id = authentication.principal.id.as_str();
        let access_token = self
            .engine
            .issue(
                TicketKind::AccessToken,
                tgt_id,
                principal_id,
                TicketData::AccessToken {
                    client_id: settings.client_id.clone(),
                    scopes: scopes.clone(),
                    authentication: authentication.clone(),
                },
            )
            .await?;

        let refresh_token = if with_refresh && settings.generate_refresh_token {
            Some(
                self.engine
                    .issue(
                        TicketKind::RefreshToken,
                        tgt_id,
                        principal_id,
                        TicketData::RefreshToken {
                            client_id: settings.client_id.clone(),
                            scopes: scopes.clone(),
                            authentication: authentication.clone(),
                        },
                    )
                    .await?
                    .id,
            )
        } else {
            None
        };

        let id_token = if scopes.contains(SCOPE_OPENID) {
            Some(self.id_token(settings, authentication, &scopes, nonce, &access_token.id)?)
        } else {
            None
        };

        info!(client_id = %settings.client_id, principal = principal_id, "issued tokens");
        Ok(TokenResponse {
            expires_in: access_token
                .expiration
                .time_to_live_seconds()
                .unwrap_or(DEFAULT_TOKEN_TTL_SECONDS),
            access_token: access_token.id,
            token_type: "Bearer".to_string(),
            refresh_token,
            id_token,
            scope: scope_string(&scopes),
        })
    }

    /// Build and sign an ID token.
    ///
    /// # Errors
    /// Returns `Internal` if signing fails.
    pub fn id_token(
        &self,
        settings: &OidcSettings,
        authentication: &Authentication,
        scopes: &BTreeSet<String>,
        nonce: Option<&str>,
        access_token: &str,
    ) -> Result<String, CasError> {
        let now = Utc::now().timestamp();
        let mut claims = Map::new();
        claims.insert("iss".to_string(), json!(self.issuer));
        claims.insert("aud".to_string(), json!(settings.client_id));
        claims.insert("sub".to_string(), json!(authentication.principal.id));
        claims.insert("iat".to_string(), json!(now));
        claims.insert("exp".to_string(), json!(now + self.id_token_ttl_seconds));
        claims.insert("jti".to_string(), json!(Ulid::new().to_string()));
        claims.insert(
            "auth_time".to_string(),
            json!(authentication.auth_time.timestamp()),
        );
        if let Some(nonce) = nonce {
            claims.insert("nonce".to_string(), json!(nonce));
        }
        claims.insert("client_id".to_string(), json!(settings.client_id));
        claims.insert(
            "preferred_username".to_string(),
            json!(authentication.principal.id),
        );
        claims.insert("acr".to_string(), json!(authentication.context_class));
        claims.insert("amr".to_string(), json!(authentication.methods));
        claims.insert("at_hash".to_string(), json!(at_hash(access_token)));

        for (name, value) in resolve_claims(&authentication.principal.attributes, scopes, settings) {
            if !RESERVED_CLAIMS.contains(&name.as_str()) {
                claims.insert(name, value);
            }
        }
        self.signer.sign(&claims)
    }

    /// Claims for the bearer of `access_token`.
    ///
    /// # Errors
    /// `TicketNotFound` / `TicketExpired` for an unusable token.
    pub async fn userinfo(&self, access_token: &str) -> Result<Map<String, Value>, CasError> {
        let validated = self
            .engine
            .find_usable(access_token, TicketKind::AccessToken)
            .await?;
        let TicketData::AccessToken {
            client_id, scopes, ..
        } = &validated.ticket.data
        else {
            return Err(CasError::TicketNotFound(access_token.to_string()));
        };
        let (_, settings) = self.client(client_id)?;
        let principal = &validated.authentication.principal;

        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!(principal.id));
        claims.insert("client_id".to_string(), json!(client_id));
        claims.insert(
            "auth_time".to_string(),
            json!(validated.authentication.auth_time.timestamp()),
        );
        for (name, value) in resolve_claims(&principal.attributes, scopes, settings) {
            claims.entry(name).or_insert(value);
        }
        Ok(claims)
    }

    #[must_use]
    pub fn discovery(&self) -> Value {
        let mut scopes: BTreeSet<String> = ["openid", "profile", "email", "address", "phone"]
            .into_iter()
            .map(str::to_string)
            .collect();
        for service in self.registry.services() {
            if let Some(settings) = &service.oidc {
                scopes.extend(settings.custom_scopes.keys().cloned());
            }
        }
        json!({
            "issuer": self.issuer,
            "authorization_endpoint": self.authorize_endpoint(),
            "token_endpoint": format!("{}/token", self.issuer),
            "userinfo_endpoint": format!("{}/profile", self.issuer),
            "jwks_uri": format!("{}/jwks", self.issuer),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code", "client_credentials", "refresh_token"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": [self.signer.algorithm_name()],
            "scopes_supported": scopes,
            "claims_supported": claims::supported_claims(),
            "code_challenge_methods_supported": ["plain", "S256"],
            "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"],
            "acr_values_supported": [crate::authn::ACR_PASSWORD, ACR_MFA],
        })
    }

    #[must_use]
    pub fn jwks(&self) -> Value {
        self.signer.jwks()
    }

    #[must_use]
    pub fn signer(&self) -> &IdTokenSigner {
        &self.signer
    }
}

impl fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcProvider")
            .field("issuer", &self.issuer)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

fn error_redirect(redirect_uri: &str, err: &CasError, state: Option<&str>) -> Result<String, CasError> {
    let mut url = Url::parse(redirect_uri).map_err(|_| CasError::InvalidRedirectUri)?;
    url.query_pairs_mut()
        .append_pair("error", err.oauth_code())
        .append_pair("error_description", &err.to_string());
    if let Some(state) = state {
        url.query_pairs_mut().append_pair("state", state);
    }
    Ok(url.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        engine::SessionRequest,
        registry::OidcSettings,
        tickets::store::MemoryTicketStore,
    };
    use secrecy::SecretString;
    use std::collections::BTreeMap;

    const ISSUER: &str = "https://sso.example.org/cas/oidc";
    const REDIRECT: &str = "https://app.example.org/callback";

    fn provider() -> (OidcProvider, Arc<TicketEngine>) {
        let settings = OidcSettings {
            client_id: "client".to_string(),
            client_secret: Some(SecretString::from("secret".to_string())),
            redirect_uri: "https://app\\.example\\.org/.*".to_string(),
            scopes: ["profile", "email"].into_iter().map(String::from).collect(),
            custom_scopes: BTreeMap::new(),
            claim_mappings: BTreeMap::new(),
            generate_refresh_token: true,
            bypass_approval: true,
            client_attributes: BTreeMap::from([(
                "role".to_string(),
                vec!["service".to_string()],
            )]),
        };
        let service = RegisteredService::new(1, "app", "https://app\\.example\\.org/.*")
            .unwrap()
            .with_oidc(settings);
        let registry = Arc::new(ServiceRegistry::new(vec![service]).unwrap());
        let engine = Arc::new(TicketEngine::new(Arc::new(MemoryTicketStore::new())));
        let provider = OidcProvider::new(
            ISSUER,
            engine.clone(),
            registry,
            Arc::new(IdTokenSigner::hs256(vec![8u8; 32])),
        );
        (provider, engine)
    }

    fn authorize_request() -> AuthorizeRequest {
        AuthorizeRequest {
            client_id: "client".to_string(),
            redirect_uri: Some(REDIRECT.to_string()),
            response_type: Some("code".to_string()),
            scope: Some("openid profile email".to_string()),
            state: Some("xyz".to_string()),
            nonce: Some("n-0S6".to_string()),
            ..AuthorizeRequest::default()
        }
    }

    async fn session(engine: &TicketEngine) -> String {
        let principal = Principal::new("casuser")
            .with_attribute("name", ["CAS User"])
            .with_attribute("given-name", ["Cas"]);
        let authentication = Authentication::new(principal, "t", "h", "pwd");
        engine
            .create_ticket_granting_ticket(authentication, &SessionRequest::new())
            .await
            .unwrap()
            .id
    }

    fn code_from(outcome: &AuthorizeOutcome) -> String {
        let AuthorizeOutcome::Redirect(url) = outcome else {
            panic!("expected redirect, got {outcome:?}");
        };
        let url = Url::parse(url).unwrap();
        url.query_pairs()
            .find(|(name, _)| name == "code")
            .map(|(_, value)| value.into_owned())
            .unwrap()
    }

    fn token_request(code: &str) -> TokenRequest {
        TokenRequest {
            grant_type: "authorization_code".to_string(),
            code: Some(code.to_string()),
            redirect_uri: Some(REDIRECT.to_string()),
            ..TokenRequest::default()
        }
    }

    fn basic() -> Option<(String, String)> {
        Some(("client".to_string(), "secret".to_string()))
    }

    #[tokio::test]
    async fn without_session_login_is_required() {
        let (provider, _) = provider();
        let outcome = provider.authorize(&authorize_request(), None).await.unwrap();
        let AuthorizeOutcome::Login { service, renew, .. } = outcome else {
            panic!("expected login");
        };
        assert!(!renew);
        assert!(service.starts_with("https://sso.example.org/cas/oidc/authorize?client_id=client"));
    }

    #[tokio::test]
    async fn unknown_redirect_uri_is_not_followed() {
        let (provider, _) = provider();
        let mut request = authorize_request();
        request.redirect_uri = Some("https://evil.example.org/cb".to_string());
        assert_eq!(
            provider.authorize(&request, None).await,
            Err(CasError::InvalidRedirectUri)
        );
    }

    #[tokio::test]
    async fn bad_response_type_redirects_with_error() {
        let (provider, _) = provider();
        let mut request = authorize_request();
        request.response_type = Some("token".to_string());
        let AuthorizeOutcome::Redirect(url) = provider.authorize(&request, None).await.unwrap() else {
            panic!("expected redirect");
        };
        assert!(url.contains("error=unsupported_response_type"));
        assert!(url.contains("state=xyz"));
    }

    #[tokio::test]
    async fn code_exchange_issues_tokens_once() {
        let (provider, engine) = provider();
        let tgt = session(&engine).await;
        let outcome = provider.authorize(&authorize_request(), Some(&tgt)).await.unwrap();
        let code = code_from(&outcome);

        let response = provider.token(&token_request(&code), basic()).await.unwrap();
        assert_eq!(response.scope, "email openid profile");
        assert!(response.refresh_token.is_some());
        let claims = provider
            .signer()
            .verify(response.id_token.as_deref().unwrap(), ISSUER, "client")
            .unwrap();
        assert_eq!(claims["sub"], "casuser");
        assert_eq!(claims["nonce"], "n-0S6");
        assert_eq!(claims["client_id"], "client");
        assert_eq!(claims["name"], "CAS User");
        assert!(!claims.contains_key("given-name"));
        assert!(!claims.contains_key("given_name"));

        let err = provider.token(&token_request(&code), basic()).await.unwrap_err();
        assert!(matches!(err, CasError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn redirect_uri_must_match_on_exchange() {
        let (provider, engine) = provider();
        let tgt = session(&engine).await;
        let code = code_from(&provider.authorize(&authorize_request(), Some(&tgt)).await.unwrap());
        let mut request = token_request(&code);
        request.redirect_uri = Some("https://app.example.org/other".to_string());
        assert!(matches!(
            provider.token(&request, basic()).await,
            Err(CasError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn wrong_client_secret_is_rejected() {
        let (provider, engine) = provider();
        let tgt = session(&engine).await;
        let code = code_from(&provider.authorize(&authorize_request(), Some(&tgt)).await.unwrap());
        let wrong = Some(("client".to_string(), "nope".to_string()));
        assert_eq!(
            provider.token(&token_request(&code), wrong).await.unwrap_err(),
            CasError::InvalidClient
        );
    }

    #[tokio::test]
    async fn max_age_forces_login_even_with_session() {
        let (provider, engine) = provider();
        let tgt = session(&engine).await;
        let mut request = authorize_request();
        request.max_age = Some(1);
        let outcome = provider.authorize(&request, Some(&tgt)).await.unwrap();
        assert!(matches!(outcome, AuthorizeOutcome::Login { renew: true, .. }));
    }

    #[tokio::test]
    async fn client_credentials_use_the_client_as_principal() {
        let (provider, _) = provider();
        let request = TokenRequest {
            grant_type: "client_credentials".to_string(),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            scope: Some("openid profile".to_string()),
            ..TokenRequest::default()
        };
        let response = provider.token(&request, None).await.unwrap();
        assert!(response.refresh_token.is_none());
        let claims = provider
            .signer()
            .verify(response.id_token.as_deref().unwrap(), ISSUER, "client")
            .unwrap();
        assert_eq!(claims["sub"], "client");
        let userinfo = provider.userinfo(&response.access_token).await.unwrap();
        assert_eq!(userinfo["sub"], "client");
    }

    #[tokio::test]
    async fn logout_invalidates_tokens() {
        let (provider, engine) = provider();
        let tgt = session(&engine).await;
        let code = code_from(&provider.authorize(&authorize_request(), Some(&tgt)).await.unwrap());
        let response = provider.token(&token_request(&code), basic()).await.unwrap();
        assert!(provider.userinfo(&response.access_token).await.is_ok());

        engine.revoke_ticket_granting_ticket(&tgt).await.unwrap();
        assert!(provider.userinfo(&response.access_token).await.is_err());
        let refresh = TokenRequest {
            grant_type: "refresh_token".to_string(),
            refresh_token: response.refresh_token.clone(),
            ..TokenRequest::default()
        };
        assert!(matches!(
            provider.token(&refresh, basic()).await,
            Err(CasError::InvalidGrant(_))
        ));
    }

    #[test]
    fn discovery_lists_endpoints() {
        let (provider, _) = provider();
        let discovery = provider.discovery();
        assert_eq!(discovery["issuer"], ISSUER);
        assert_eq!(discovery["token_endpoint"], format!("{ISSUER}/token"));
        assert_eq!(discovery["id_token_signing_alg_values_supported"][0], "HS256");
    }
}
