#![allow(dead_code)]

use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, Response, StatusCode, header},
};
use async_trait::async_trait;
use secrecy::SecretString;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tessera::{
    api::{
        self,
        state::{AppState, Components},
    },
    authn::accounts::AccountsAuthenticationHandler,
    config::ServerConfig,
    error::CasError,
    registry::ServiceRegistry,
    tickets::store::MemoryTicketStore,
    validation::ProxyCallback,
};
use tower::ServiceExt;
use url::Url;

pub const PREFIX: &str = "http://localhost:8080";
pub const USER_AGENT: &str = "tessera-tests/1.0";
pub const ACTUATOR_TOKEN: &str = "actuator-s3cret";

pub const SERVICES: &str = r#"[
  {
    "id": 1,
    "name": "app",
    "service_id": "https://app\\.example\\.org/.*",
    "attribute_release": { "type": "return_all" }
  },
  {
    "id": 2,
    "name": "secure",
    "service_id": "https://secure\\.example\\.org/.*",
    "mfa_providers": ["mfa-gauth"]
  },
  {
    "id": 3,
    "name": "oidc-client",
    "service_id": "https://client\\.example\\.org/.*",
    "oidc": {
      "client_id": "client",
      "client_secret": "client-secret",
      "redirect_uri": "https://client\\.example\\.org/callback",
      "scopes": ["profile", "email"],
      "generate_refresh_token": true
    }
  },
  {
    "id": 4,
    "name": "saml-sp",
    "service_id": "https://sp\\.example\\.org/.*",
    "saml": {
      "entity_id": "https://sp.example.org/shibboleth",
      "acs_url": "https://sp.example.org/Shibboleth.sso/SAML2/POST"
    }
  },
  {
    "id": 5,
    "name": "disabled",
    "service_id": "https://disabled\\.example\\.org/.*",
    "access_strategy": { "enabled": false }
  },
  {
    "id": 6,
    "name": "portal",
    "service_id": "https://portal\\.example\\.org/.*",
    "proxy_policy": { "type": "regex", "pattern": "https://portal\\.example\\.org/pgtCallback" }
  }
]"#;

pub const ACCOUNTS: &str = r#"{
  "casuser": {
    "password": "Mellon",
    "attributes": { "mail": ["casuser@example.org"], "cn": ["CAS User"] }
  },
  "locked": { "password": "Mellon", "status": "locked" }
}"#;

pub fn signing_key_path() -> PathBuf {
    PathBuf::from(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/signing-key.pem"
    ))
}

pub fn config() -> ServerConfig {
    ServerConfig::new()
        .with_server_prefix(PREFIX)
        .with_saml_signing_key_path(Some(signing_key_path()))
        .with_actuator_token(Some(SecretString::from(ACTUATOR_TOKEN.to_string())))
}

/// Proxy callback endpoint that accepts every PGT and remembers it by IOU.
#[derive(Debug, Default)]
pub struct PgtReceiver {
    received: Mutex<HashMap<String, String>>,
}

impl PgtReceiver {
    pub fn pgt_for(&self, pgt_iou: &str) -> Option<String> {
        self.received.lock().ok()?.get(pgt_iou).cloned()
    }
}

#[async_trait]
impl ProxyCallback for PgtReceiver {
    async fn deliver(&self, _callback_url: &str, pgt_iou: &str, pgt_id: &str) -> Result<(), CasError> {
        self.received
            .lock()
            .map_err(|_| CasError::InvalidProxyCallback)?
            .insert(pgt_iou.to_string(), pgt_id.to_string());
        Ok(())
    }
}

fn build(
    config: ServerConfig,
    proxy_callback: Option<Arc<dyn ProxyCallback>>,
) -> Result<(Router, Arc<AppState>)> {
    let components = Components {
        store: Arc::new(MemoryTicketStore::new()),
        registry: ServiceRegistry::from_json(SERVICES)?,
        accounts: AccountsAuthenticationHandler::from_json(ACCOUNTS)?,
        delegated_clients: Vec::new(),
        proxy_callback,
    };
    let state = Arc::new(AppState::build(config, components)?);
    Ok((api::app(state.clone()), state))
}

/// Application over an in-memory ticket store.
pub fn app_with(config: ServerConfig) -> Result<(Router, Arc<AppState>)> {
    build(config, None)
}

/// Application whose proxy callbacks land in the returned receiver.
pub fn app_with_pgt_receiver() -> Result<(Router, Arc<PgtReceiver>)> {
    let receiver = Arc::new(PgtReceiver::default());
    let (app, _state) = build(config(), Some(receiver.clone()))?;
    Ok((app, receiver))
}

pub fn app() -> Result<(Router, Arc<AppState>)> {
    app_with(config())
}

/// Percent-encode a form or query string.
pub fn encode(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

pub fn get(uri: &str, cookie: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::USER_AGENT, USER_AGENT);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    Ok(builder.body(Body::empty())?)
}

pub fn post_form(uri: &str, pairs: &[(&str, &str)], cookie: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::USER_AGENT, USER_AGENT)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    Ok(builder.body(Body::from(encode(pairs)))?)
}

pub async fn send(app: &Router, request: Request<Body>) -> Result<Response<Body>> {
    Ok(app.clone().oneshot(request).await?)
}

pub async fn body_string(response: Response<Body>) -> Result<String> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

pub async fn body_json(response: Response<Body>) -> Result<serde_json::Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn location(headers: &HeaderMap) -> Result<String> {
    Ok(headers
        .get(header::LOCATION)
        .context("missing Location header")?
        .to_str()?
        .to_string())
}

/// `TGC=...` pair from the response's session cookie, ready for a `Cookie` header.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .find(|pair| pair.starts_with("TGC=") && pair.len() > "TGC=".len())
        .map(str::to_string)
}

pub fn query_param(url: &str, name: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid URL {url}"))?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .with_context(|| format!("{name} missing from {url}"))
}

/// Path and query of an absolute URL served by the test server.
pub fn local_path(url: &str) -> Result<String> {
    url.strip_prefix(PREFIX)
        .map(str::to_string)
        .with_context(|| format!("{url} is not served by {PREFIX}"))
}

/// Log in with a password for `service`, returning the redirect and the session cookie.
pub async fn login(app: &Router, service: &str) -> Result<(Response<Body>, String)> {
    let response = send(
        app,
        post_form(
            "/login",
            &[
                ("username", "casuser"),
                ("password", "Mellon"),
                ("service", service),
            ],
            None,
        )?,
    )
    .await?;
    anyhow::ensure!(
        response.status() == StatusCode::FOUND,
        "login returned {}",
        response.status()
    );
    let cookie = session_cookie(response.headers()).context("login did not set TGC")?;
    Ok((response, cookie))
}
