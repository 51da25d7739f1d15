//! Service validation: consumes service and proxy tickets for relying applications and
//! releases the principal's attributes under the service's policy.

pub mod jwt;
pub mod response;

use anyhow::Context;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    APP_USER_AGENT,
    engine::{TicketEngine, ValidatedTicket},
    error::CasError,
    principal::{Attributes, MergeStrategy, merge},
    registry::{RegisteredService, ServiceRegistry},
    tickets::{TicketData, TicketKind},
};

use self::jwt::{JwtTicketCodec, is_jwt};

/// Which validation endpoint is being served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationEndpoint {
    /// `/validate`
    Cas1,
    /// `/serviceValidate`, `/p3/serviceValidate`
    Service,
    /// `/proxyValidate`, `/p3/proxyValidate`
    Proxy,
}

#[derive(Clone, Debug)]
pub struct ValidationRequest {
    pub ticket: String,
    pub service: String,
    pub pgt_url: Option<String>,
    pub renew: bool,
    pub endpoint: ValidationEndpoint,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationSuccess {
    pub user: String,
    pub attributes: Attributes,
    /// `PGTIOU-` handed back when a proxy callback succeeded.
    pub proxy_granting_ticket: Option<String>,
    /// Proxy chain for proxy tickets, most recent first.
    pub proxies: Vec<String>,
}

/// Delivers a PGT to a proxy callback URL.
#[async_trait]
pub trait ProxyCallback: Send + Sync {
    /// # Errors
    /// Returns an error if the callback is unreachable or does not answer with success.
    async fn deliver(&self, callback_url: &str, pgt_iou: &str, pgt_id: &str) -> Result<(), CasError>;
}

#[derive(Debug, Clone)]
pub struct HttpProxyCallback {
    client: reqwest::Client,
}

impl HttpProxyCallback {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build proxy callback client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProxyCallback for HttpProxyCallback {
    async fn deliver(&self, callback_url: &str, pgt_iou: &str, pgt_id: &str) -> Result<(), CasError> {
        let mut url = Url::parse(callback_url).map_err(|_| CasError::InvalidProxyCallback)?;
        url.query_pairs_mut()
            .append_pair("pgtIou", pgt_iou)
            .append_pair("pgtId", pgt_id);

        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                CasError::ExternalProviderTimeout(callback_url.to_string())
            } else {
                CasError::ExternalProvider(callback_url.to_string())
            }
        })?;
        if response.status().is_success() {
            Ok(())
        } else {
            debug!(status = %response.status(), "proxy callback refused the PGT");
            Err(CasError::InvalidProxyCallback)
        }
    }
}

/// Compare service URLs ignoring fragments and a trailing slash.
#[must_use]
pub fn services_match(issued: &str, presented: &str) -> bool {
    fn normalize(value: &str) -> Option<String> {
        let mut url = Url::parse(value).ok()?;
        url.set_fragment(None);
        let mut normalized = url.to_string();
        if url.query().is_none() && normalized.ends_with('/') {
            normalized.pop();
        }
        Some(normalized)
    }
    match (normalize(issued), normalize(presented)) {
        (Some(issued), Some(presented)) => issued == presented,
        _ => issued == presented,
    }
}

/// Attributes released to `service` for a validated ticket.
#[must_use]
pub fn released_attributes(
    registered: &RegisteredService,
    validated: &ValidatedTicket,
    from_new_login: bool,
) -> Attributes {
    let mut attributes = registered
        .attribute_release
        .release(&validated.authentication.principal.attributes);
    if registered.release_authentication_attributes {
        merge(
            &mut attributes,
            validated.authentication.attributes(from_new_login),
            MergeStrategy::Replace,
        );
    }
    attributes
}

pub struct ServiceValidator {
    engine: Arc<TicketEngine>,
    registry: Arc<ServiceRegistry>,
    codec: Arc<JwtTicketCodec>,
    callback: Arc<dyn ProxyCallback>,
}

impl ServiceValidator {
    #[must_use]
    pub fn new(
        engine: Arc<TicketEngine>,
        registry: Arc<ServiceRegistry>,
        codec: Arc<JwtTicketCodec>,
        callback: Arc<dyn ProxyCallback>,
    ) -> Self {
        Self {
            engine,
            registry,
            codec,
            callback,
        }
    }

    /// Validate (and consume) a service or proxy ticket.
    ///
    /// # Errors
    /// `InvalidRequest` without ticket or service; `TicketNotFound`, `TicketExpired`,
    /// `TicketAlreadyConsumed`, `InvalidTicketSpec`, `ServiceMismatch`,
    /// `TicketNotFromNewLogin` or `ServiceUnauthorized` otherwise.
    #[instrument(skip_all, fields(service = %request.service, endpoint = ?request.endpoint))]
    pub async fn validate(&self, request: &ValidationRequest) -> Result<ValidationSuccess, CasError> {
        if request.ticket.trim().is_empty() || request.service.trim().is_empty() {
            return Err(CasError::InvalidRequest(
                "ticket and service are required".to_string(),
            ));
        }

        // A JWT ticket's audience is checked after consumption, like the stored service of
        // a plain ticket, so a mismatched presentation burns it either way.
        let (ticket_id, audience) = if is_jwt(&request.ticket) {
            let claims = self.codec.decode(&request.ticket)?;
            (claims.jti, Some(claims.aud))
        } else {
            (request.ticket.clone(), None)
        };

        let kind = TicketKind::from_id(&ticket_id)
            .ok_or_else(|| CasError::TicketNotFound(ticket_id.clone()))?;
        let kinds: &[TicketKind] = match (kind, request.endpoint) {
            (TicketKind::Service, _) => &[TicketKind::Service],
            (TicketKind::Proxy, ValidationEndpoint::Proxy) => &[TicketKind::Proxy],
            _ => return Err(CasError::InvalidTicketSpec(ticket_id)),
        };

        let validated = self.engine.consume(&ticket_id, kinds).await?;
        let (issued_for, from_new_login, proxies) = match &validated.ticket.data {
            TicketData::Service {
                service,
                from_new_login,
            } => (service.as_str(), *from_new_login, Vec::new()),
            TicketData::Proxy { service, proxies } => (service.as_str(), false, proxies.clone()),
            _ => return Err(CasError::InvalidTicketSpec(ticket_id)),
        };
        let audience_ok = audience
            .as_deref()
            .map_or(true, |audience| services_match(audience, &request.service));
        if !audience_ok || !services_match(issued_for, &request.service) {
            warn!(ticket = %ticket_id, issued_for, "service mismatch");
            return Err(CasError::ServiceMismatch);
        }
        if request.renew && !from_new_login {
            return Err(CasError::TicketNotFromNewLogin(ticket_id));
        }

        let registered = self
            .registry
            .find(&request.service)
            .ok_or(CasError::ServiceUnauthorized)?;
        registered
            .access_strategy
            .authorize(&validated.authentication.principal)?;

        let proxy_granting_ticket = match &request.pgt_url {
            Some(pgt_url) if request.endpoint != ValidationEndpoint::Cas1 => {
                self.issue_proxy_granting_ticket(registered, &validated, pgt_url)
                    .await
            }
            _ => None,
        };

        info!(
            ticket = %ticket_id,
            principal = %validated.authentication.principal.id,
            "validated ticket"
        );
        Ok(ValidationSuccess {
            user: validated.authentication.principal.id.clone(),
            attributes: released_attributes(registered, &validated, from_new_login),
            proxy_granting_ticket,
            proxies,
        })
    }

    /// Deliver a PGT to the callback and keep it if delivery succeeds. Failures only
    /// drop the PGT; the validation itself still succeeds.
    async fn issue_proxy_granting_ticket(
        &self,
        registered: &RegisteredService,
        validated: &ValidatedTicket,
        pgt_url: &str,
    ) -> Option<String> {
        if !registered.proxy_policy.allows(pgt_url) {
            warn!(pgt_url, "proxy callback not allowed for service");
            return None;
        }
        let ids = self.engine.ids();
        let (pgt_id, pgt_iou) = match (
            ids.next(TicketKind::ProxyGranting),
            ids.next_with_prefix("PGTIOU"),
        ) {
            (Ok(pgt_id), Ok(pgt_iou)) => (pgt_id, pgt_iou),
            _ => return None,
        };

        if let Err(err) = self.callback.deliver(pgt_url, &pgt_iou, &pgt_id).await {
            warn!(pgt_url, "proxy callback failed: {}", err);
            return None;
        }
        match self
            .engine
            .grant_proxy_granting_ticket(pgt_id, validated, pgt_url)
            .await
        {
            Ok(_) => Some(pgt_iou),
            Err(err) => {
                warn!("failed to store proxy-granting ticket: {}", err);
                None
            }
        }
    }

    /// Issue a proxy ticket for `target_service` from a PGT.
    ///
    /// # Errors
    /// `InvalidRequest` for missing parameters, `ServiceUnauthorized` for unknown target
    /// services, `TicketNotFound`/`TicketExpired` for an unusable PGT.
    pub async fn proxy(&self, pgt: &str, target_service: &str) -> Result<String, CasError> {
        if pgt.trim().is_empty() || target_service.trim().is_empty() {
            return Err(CasError::InvalidRequest(
                "pgt and targetService are required".to_string(),
            ));
        }
        if TicketKind::from_id(pgt) != Some(TicketKind::ProxyGranting) {
            return Err(CasError::InvalidTicketSpec(pgt.to_string()));
        }
        let registered = self
            .registry
            .find(target_service)
            .ok_or(CasError::ServiceUnauthorized)?;
        let ticket = self
            .engine
            .grant_proxy_ticket(pgt, target_service, registered)
            .await?;
        Ok(ticket.id)
    }
}

impl std::fmt::Debug for ServiceValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceValidator")
            .field("services", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        authn::{Authentication, CREDENTIAL_USERNAME_PASSWORD},
        engine::SessionRequest,
        principal::Principal,
        registry::{AttributeReleasePolicy, ProxyPolicy},
        tickets::store::MemoryTicketStore,
    };
    use std::sync::Mutex;

    const APP: &str = "https://app.example.org/";
    const PROXY: &str = "https://proxy.example.org/";
    const CALLBACK: &str = "https://proxy.example.org/pgtCallback";

    #[derive(Default)]
    struct RecordingCallback {
        delivered: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ProxyCallback for RecordingCallback {
        async fn deliver(&self, _url: &str, pgt_iou: &str, pgt_id: &str) -> Result<(), CasError> {
            if self.fail {
                return Err(CasError::InvalidProxyCallback);
            }
            self.delivered
                .lock()
                .unwrap()
                .push((pgt_iou.to_string(), pgt_id.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        engine: Arc<TicketEngine>,
        validator: ServiceValidator,
        callback: Arc<RecordingCallback>,
        codec: Arc<JwtTicketCodec>,
    }

    fn fixture(fail_callback: bool) -> Fixture {
        let engine = Arc::new(TicketEngine::new(Arc::new(MemoryTicketStore::new())));
        let registry = ServiceRegistry::new(vec![
            RegisteredService::new(1, "app", r"https://app\.example\.org/.*")
                .unwrap()
                .with_attribute_release(AttributeReleasePolicy::ReturnAllowed {
                    allowed: vec!["mail".to_string()],
                }),
            RegisteredService::new(2, "proxy", r"https://proxy\.example\.org/.*")
                .unwrap()
                .with_attribute_release(AttributeReleasePolicy::ReturnAll)
                .with_proxy_policy(ProxyPolicy::Regex {
                    pattern: r"https://proxy\.example\.org/.*".to_string(),
                }),
        ])
        .unwrap();
        let codec = Arc::new(JwtTicketCodec::new(
            "https://sso.example.org/cas",
            vec![3u8; 64],
            [4u8; 32],
        ));
        let callback = Arc::new(RecordingCallback {
            fail: fail_callback,
            ..RecordingCallback::default()
        });
        let validator = ServiceValidator::new(
            engine.clone(),
            Arc::new(registry),
            codec.clone(),
            callback.clone(),
        );
        Fixture {
            engine,
            validator,
            callback,
            codec,
        }
    }

    async fn login(engine: &TicketEngine) -> String {
        let authentication = Authentication::new(
            Principal::new("casuser")
                .with_attribute("mail", ["casuser@example.org"])
                .with_attribute("phone", ["555"]),
            CREDENTIAL_USERNAME_PASSWORD,
            "StaticAccountsAuthenticationHandler",
            "pwd",
        );
        engine
            .create_ticket_granting_ticket(authentication, &SessionRequest::new())
            .await
            .unwrap()
            .id
    }

    async fn service_ticket(engine: &TicketEngine, tgt: &str, service: &str) -> String {
        let registered = RegisteredService::new(9, "any", ".*").unwrap();
        engine
            .grant_service_ticket(tgt, service, &registered)
            .await
            .unwrap()
            .id
    }

    fn request(ticket: &str, service: &str) -> ValidationRequest {
        ValidationRequest {
            ticket: ticket.to_string(),
            service: service.to_string(),
            pgt_url: None,
            renew: false,
            endpoint: ValidationEndpoint::Service,
        }
    }

    #[tokio::test]
    async fn releases_allowed_attributes_once() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, APP).await;

        let success = f.validator.validate(&request(&st, APP)).await.unwrap();
        assert_eq!(success.user, "casuser");
        assert_eq!(success.attributes["mail"], vec!["casuser@example.org"]);
        assert!(!success.attributes.contains_key("phone"));
        assert_eq!(success.attributes["isFromNewLogin"], vec!["true"]);
        assert_eq!(
            success.attributes["authnContextClass"],
            vec![crate::authn::ACR_PASSWORD]
        );

        assert_eq!(
            f.validator.validate(&request(&st, APP)).await.unwrap_err(),
            CasError::TicketAlreadyConsumed(st)
        );
    }

    #[tokio::test]
    async fn service_mismatch_consumes_ticket() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, APP).await;
        assert_eq!(
            f.validator
                .validate(&request(&st, "https://app.example.org/other"))
                .await
                .unwrap_err(),
            CasError::ServiceMismatch
        );
        assert!(f.validator.validate(&request(&st, APP)).await.is_err());
    }

    #[tokio::test]
    async fn trailing_slash_is_not_a_mismatch() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, "https://app.example.org/home/").await;
        assert!(f
            .validator
            .validate(&request(&st, "https://app.example.org/home"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn renew_requires_new_login() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let first = service_ticket(&f.engine, &tgt, APP).await;
        let second = service_ticket(&f.engine, &tgt, APP).await;

        let mut renew = request(&first, APP);
        renew.renew = true;
        assert!(f.validator.validate(&renew).await.is_ok());

        let mut renew = request(&second, APP);
        renew.renew = true;
        assert_eq!(
            f.validator.validate(&renew).await.unwrap_err(),
            CasError::TicketNotFromNewLogin(second)
        );
    }

    #[tokio::test]
    async fn missing_parameters_and_unknown_tickets() {
        let f = fixture(false);
        assert!(matches!(
            f.validator.validate(&request("", APP)).await,
            Err(CasError::InvalidRequest(_))
        ));
        assert_eq!(
            f.validator.validate(&request("ST-1-nope", APP)).await.unwrap_err(),
            CasError::TicketNotFound("ST-1-nope".to_string())
        );
        assert_eq!(
            f.validator.validate(&request("bogus", APP)).await.unwrap_err(),
            CasError::TicketNotFound("bogus".to_string())
        );
    }

    #[tokio::test]
    async fn logout_invalidates_outstanding_tickets() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, APP).await;
        f.engine.revoke_ticket_granting_ticket(&tgt).await.unwrap();
        assert_eq!(
            f.validator.validate(&request(&st, APP)).await.unwrap_err().cas_code(),
            "INVALID_TICKET"
        );
    }

    #[tokio::test]
    async fn proxy_chain() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, PROXY).await;

        let mut with_callback = request(&st, PROXY);
        with_callback.pgt_url = Some(CALLBACK.to_string());
        let success = f.validator.validate(&with_callback).await.unwrap();
        let iou = success.proxy_granting_ticket.unwrap();
        assert!(iou.starts_with("PGTIOU-"));

        let (delivered_iou, pgt) = f.callback.delivered.lock().unwrap()[0].clone();
        assert_eq!(delivered_iou, iou);

        let pt = f.validator.proxy(&pgt, APP).await.unwrap();
        assert!(pt.starts_with("PT-"));

        // proxy tickets are not accepted by serviceValidate
        assert_eq!(
            f.validator.validate(&request(&pt, APP)).await.unwrap_err(),
            CasError::InvalidTicketSpec(pt.clone())
        );

        let mut proxy_validate = request(&pt, APP);
        proxy_validate.endpoint = ValidationEndpoint::Proxy;
        let success = f.validator.validate(&proxy_validate).await.unwrap();
        assert_eq!(success.user, "casuser");
        assert_eq!(success.proxies, vec![CALLBACK.to_string()]);
    }

    #[tokio::test]
    async fn pgt_requires_allowed_callback() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, APP).await;
        let mut with_callback = request(&st, APP);
        with_callback.pgt_url = Some(CALLBACK.to_string());
        let success = f.validator.validate(&with_callback).await.unwrap();
        assert!(success.proxy_granting_ticket.is_none());
        assert!(f.callback.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_callback_omits_pgt() {
        let f = fixture(true);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, PROXY).await;
        let mut with_callback = request(&st, PROXY);
        with_callback.pgt_url = Some(CALLBACK.to_string());
        let success = f.validator.validate(&with_callback).await.unwrap();
        assert!(success.proxy_granting_ticket.is_none());
        assert!(f.engine.tickets(Some(TicketKind::ProxyGranting), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jwt_service_mismatch_consumes_ticket() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, APP).await;
        let token = f
            .codec
            .encode(&st, APP, "casuser", CREDENTIAL_USERNAME_PASSWORD, &Attributes::new(), 10)
            .unwrap();

        assert_eq!(
            f.validator
                .validate(&request(&token, "https://app.example.org/else"))
                .await
                .unwrap_err(),
            CasError::ServiceMismatch
        );
        assert_eq!(
            f.validator.validate(&request(&token, APP)).await.unwrap_err(),
            CasError::TicketAlreadyConsumed(st.clone())
        );
    }

    #[tokio::test]
    async fn jwt_ticket_validates_once() {
        let f = fixture(false);
        let tgt = login(&f.engine).await;
        let st = service_ticket(&f.engine, &tgt, APP).await;
        let token = f
            .codec
            .encode(&st, APP, "casuser", CREDENTIAL_USERNAME_PASSWORD, &Attributes::new(), 10)
            .unwrap();

        assert_eq!(f.validator.validate(&request(&token, APP)).await.unwrap().user, "casuser");
        assert_eq!(
            f.validator.validate(&request(&token, APP)).await.unwrap_err(),
            CasError::TicketAlreadyConsumed(st)
        );
    }

    #[test]
    fn service_normalization() {
        assert!(services_match("https://a.example.org/", "https://a.example.org"));
        assert!(services_match("https://a.example.org/x#frag", "https://a.example.org/x"));
        assert!(!services_match("https://a.example.org/x", "https://a.example.org/y"));
        assert!(!services_match("https://a.example.org/?a=1", "https://a.example.org/?a=2"));
    }
}
