//! SAML2 IdP front-channel.
//!
//! Like the OIDC adapter, an `AuthnRequest` that cannot be answered from the current SSO
//! session is sent to `/login` with a callback URL carrying the (re-encoded) request as
//! the CAS service. The callback consumes the service ticket and posts the signed
//! response to the SP.

pub mod request;
pub mod response;
pub mod signing;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Duration;
use std::{fmt, sync::Arc};
use tracing::{info, instrument};
use url::{Url, form_urlencoded};

use crate::{
    engine::{TicketEngine, ValidatedTicket},
    error::CasError,
    mfa,
    registry::{RegisteredService, SamlSettings, ServiceRegistry},
    tickets::{TicketData, TicketKind},
    validation::{released_attributes, response::xml_escape, services_match},
};

use self::{
    request::{AuthnRequest, decode_redirect, encode_redirect},
    response::{AssertionParams, build_response, post_form},
    signing::SamlSigner,
};

pub const SSO_REDIRECT_PATH: &str = "/idp/profile/SAML2/Redirect/SSO";
pub const SSO_POST_PATH: &str = "/idp/profile/SAML2/POST/SSO";
pub const CALLBACK_PATH: &str = "/idp/profile/SAML2/Callback";
pub const METADATA_PATH: &str = "/idp/metadata";

const DEFAULT_ASSERTION_VALIDITY_SECONDS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlPost {
    pub acs_url: String,
    /// Base64 encoded `samlp:Response`.
    pub saml_response: String,
    pub relay_state: Option<String>,
}

impl SamlPost {
    #[must_use]
    pub fn html(&self) -> String {
        post_form(&self.acs_url, &self.saml_response, self.relay_state.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamlOutcome {
    Login {
        service: String,
        renew: bool,
        requested_contexts: Vec<String>,
    },
    Post(SamlPost),
}

pub struct SamlIdp {
    entity_id: String,
    prefix: String,
    engine: Arc<TicketEngine>,
    registry: Arc<ServiceRegistry>,
    signer: Arc<SamlSigner>,
    validity: Duration,
}

impl SamlIdp {
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        prefix: impl Into<String>,
        engine: Arc<TicketEngine>,
        registry: Arc<ServiceRegistry>,
        signer: Arc<SamlSigner>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
            engine,
            registry,
            signer,
            validity: Duration::seconds(DEFAULT_ASSERTION_VALIDITY_SECONDS),
        }
    }

    #[must_use]
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    #[must_use]
    pub fn signer(&self) -> &SamlSigner {
        &self.signer
    }

    fn service_provider(&self, issuer: &str) -> Result<(&RegisteredService, &SamlSettings), CasError> {
        let registered = self
            .registry
            .find_by_entity_id(issuer)
            .ok_or(CasError::ServiceUnauthorized)?;
        let settings = registered.saml.as_ref().ok_or(CasError::ServiceUnauthorized)?;
        Ok((registered, settings))
    }

    /// The requested ACS must be the registered one.
    fn acs_url(request: &AuthnRequest, settings: &SamlSettings) -> Result<String, CasError> {
        match &request.acs_url {
            Some(requested) if requested != &settings.acs_url => Err(CasError::ServiceUnauthorized),
            _ => Ok(settings.acs_url.clone()),
        }
    }

    /// URL `/login` returns to with a service ticket.
    ///
    /// # Errors
    /// Returns `Internal` if the request cannot be re-encoded.
    pub fn callback_url(&self, request: &AuthnRequest, relay_state: Option<&str>) -> Result<String, CasError> {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("SAMLRequest", &encode_redirect(request)?);
        if let Some(relay_state) = relay_state {
            query.append_pair("RelayState", relay_state);
        }
        Ok(format!("{}{CALLBACK_PATH}?{}", self.prefix, query.finish()))
    }

    /// The `AuthnRequest` embedded in a callback URL, if `service` is one.
    #[must_use]
    pub fn request_from_callback(&self, service: &str) -> Option<AuthnRequest> {
        if !service.starts_with(&format!("{}{CALLBACK_PATH}?", self.prefix)) {
            return None;
        }
        let url = Url::parse(service).ok()?;
        let encoded = url
            .query_pairs()
            .find(|(name, _)| name == "SAMLRequest")
            .map(|(_, value)| value.into_owned())?;
        decode_redirect(&encoded).ok()
    }

    /// Registered service of the SP behind a callback URL.
    #[must_use]
    pub fn service_for_callback(&self, service: &str) -> Option<&RegisteredService> {
        let request = self.request_from_callback(service)?;
        self.registry.find_by_entity_id(&request.issuer)
    }

    /// Answer an `AuthnRequest`, from the SSO session when possible.
    ///
    /// # Errors
    /// `ServiceUnauthorized` for unknown SPs or a foreign ACS URL; store failures.
    #[instrument(skip_all, fields(sp = %request.issuer))]
    pub async fn sso(
        &self,
        request: &AuthnRequest,
        relay_state: Option<&str>,
        session: Option<&str>,
    ) -> Result<SamlOutcome, CasError> {
        let (registered, settings) = self.service_provider(&request.issuer)?;
        Self::acs_url(request, settings)?;
        let callback = self.callback_url(request, relay_state)?;

        if let (Some(tgt_id), false) = (session, request.force_authn) {
            if let Ok(tgt) = self
                .engine
                .find_usable(tgt_id, TicketKind::TicketGranting)
                .await
            {
                let participates = self
                    .engine
                    .sso()
                    .participates(&tgt.ticket.principal_id, Some(registered));
                if participates
                    && mfa::is_satisfied(registered, &request.requested_contexts, &tgt.authentication)
                {
                    let ticket = self
                        .engine
                        .grant_service_ticket(tgt_id, &callback, registered)
                        .await?;
                    let validated = self.engine.consume(&ticket.id, &[TicketKind::Service]).await?;
                    return self.respond(request, registered, settings, &validated, relay_state);
                }
            }
        }

        Ok(SamlOutcome::Login {
            service: callback,
            renew: request.force_authn,
            requested_contexts: request.requested_contexts.clone(),
        })
    }

    /// Complete a request after `/login` issued `ticket` for the callback URL.
    ///
    /// # Errors
    /// Ticket failures, `ServiceMismatch`, `TicketNotFromNewLogin` when `ForceAuthn` was
    /// not honored, `MfaFailed` when a requested MFA context is unsatisfied.
    #[instrument(skip_all)]
    pub async fn callback(
        &self,
        saml_request: &str,
        relay_state: Option<&str>,
        ticket: &str,
    ) -> Result<SamlOutcome, CasError> {
        let request = decode_redirect(saml_request)?;
        let (registered, settings) = self.service_provider(&request.issuer)?;
        let validated = self.engine.consume(ticket, &[TicketKind::Service]).await?;
        let TicketData::Service {
            service,
            from_new_login,
        } = &validated.ticket.data
        else {
            return Err(CasError::InvalidTicketSpec(ticket.to_string()));
        };
        if !services_match(service, &self.callback_url(&request, relay_state)?) {
            return Err(CasError::ServiceMismatch);
        }
        if request.force_authn && !from_new_login {
            return Err(CasError::TicketNotFromNewLogin(ticket.to_string()));
        }
        if !mfa::is_satisfied(registered, &request.requested_contexts, &validated.authentication) {
            return Err(CasError::MfaFailed);
        }
        self.respond(&request, registered, settings, &validated, relay_state)
    }

    fn respond(
        &self,
        request: &AuthnRequest,
        registered: &RegisteredService,
        settings: &SamlSettings,
        validated: &ValidatedTicket,
        relay_state: Option<&str>,
    ) -> Result<SamlOutcome, CasError> {
        let acs_url = Self::acs_url(request, settings)?;
        let from_new_login = matches!(
            validated.ticket.data,
            TicketData::Service {
                from_new_login: true,
                ..
            }
        );
        let attributes = released_attributes(registered, validated, from_new_login);
        let principal = &validated.authentication.principal;
        let name_id = settings
            .name_id_attribute
            .as_deref()
            .and_then(|attribute| principal.first(attribute))
            .unwrap_or(&principal.id);

        let xml = build_response(
            &AssertionParams {
                issuer: &self.entity_id,
                audience: &settings.entity_id,
                acs_url: &acs_url,
                in_response_to: &request.id,
                name_id,
                session_index: &validated.ticket.id,
                authentication: &validated.authentication,
                attributes: &attributes,
                validity: self.validity,
            },
            &self.signer,
        )?;
        info!(sp = %settings.entity_id, principal = %principal.id, "issued SAML assertion");
        Ok(SamlOutcome::Post(SamlPost {
            acs_url,
            saml_response: STANDARD.encode(xml),
            relay_state: relay_state.map(str::to_string),
        }))
    }

    /// `md:EntityDescriptor` of the IdP.
    #[must_use]
    pub fn metadata(&self) -> String {
        format!(
            concat!(
                r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" entityID="{entity_id}">"#,
                r#"<md:IDPSSODescriptor WantAuthnRequestsSigned="false" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
                r#"<md:KeyDescriptor use="signing">{key_info}</md:KeyDescriptor>"#,
                "<md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified</md:NameIDFormat>",
                r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{prefix}{redirect}"/>"#,
                r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{prefix}{post}"/>"#,
                "</md:IDPSSODescriptor></md:EntityDescriptor>"
            ),
            entity_id = xml_escape(&self.entity_id),
            key_info = self.signer.key_info(),
            prefix = xml_escape(&self.prefix),
            redirect = SSO_REDIRECT_PATH,
            post = SSO_POST_PATH,
        )
    }
}

impl fmt::Debug for SamlIdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamlIdp")
            .field("entity_id", &self.entity_id)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
