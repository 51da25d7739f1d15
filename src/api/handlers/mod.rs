pub mod actuator;
pub mod health;
pub mod login;
pub mod logout;
pub mod oidc;
pub mod saml;
pub mod validate;

// common functions for the handlers
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::{
    api::state::AppState,
    authn::Authentication,
    engine::ValidatedTicket,
    error::CasError,
    mfa::{self, MfaTrigger},
    registry::RegisteredService,
    tickets::{Ticket, TicketData},
    validation::released_attributes,
};

const DEFAULT_SERVICE_TICKET_TTL_SECONDS: i64 = 10;

/// `302 Found` to `location`.
///
/// # Errors
/// `InvalidRequest` when `location` is not a valid header value.
pub fn found(location: &str) -> Result<Response, CasError> {
    let location = HeaderValue::from_str(location)
        .map_err(|_| CasError::InvalidRequest("invalid redirect location".to_string()))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

/// `url` with `name=value` appended to its query.
///
/// # Errors
/// `InvalidRequest` when `url` does not parse.
pub fn with_query_param(url: &str, name: &str, value: &str) -> Result<String, CasError> {
    let mut parsed = Url::parse(url)
        .map_err(|_| CasError::InvalidRequest(format!("invalid service URL {url}")))?;
    parsed.query_pairs_mut().append_pair(name, value);
    Ok(parsed.to_string())
}

/// Treat empty form values as absent.
pub fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|value| !value.trim().is_empty()))
}

/// CAS boolean flags: `true`, `1` and an empty value (as in `?renew`) all enable.
pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.is_some_and(|value| {
        let value = value.trim();
        value.is_empty() || value.eq_ignore_ascii_case("true") || value == "1"
    }))
}

/// Registered service allowed to receive tickets for `service`.
///
/// # Errors
/// `ServiceUnauthorized` for unknown or disabled services.
pub fn authorized_service<'a>(
    state: &'a AppState,
    service: &str,
) -> Result<&'a RegisteredService, CasError> {
    state
        .resolve_service(service)
        .filter(|registered| registered.access_strategy.enabled)
        .ok_or(CasError::ServiceUnauthorized)
}

/// Whether an existing session already satisfies the second factor the request demands.
///
/// # Errors
/// `InvalidRequest` when the demanded provider is unknown.
pub fn mfa_satisfied(
    state: &AppState,
    trigger: &MfaTrigger<'_>,
    authentication: &Authentication,
) -> Result<bool, CasError> {
    let Some(provider) = state.mfa().required_provider(trigger)? else {
        return Ok(true);
    };
    if authentication.mfa_provider.as_deref() == Some(provider.as_str()) {
        return Ok(true);
    }
    Ok(trigger.requested_method.is_none()
        && authentication.is_mfa()
        && trigger.service.map_or(true, |service| {
            mfa::is_satisfied(service, trigger.requested_contexts, authentication)
        }))
}

/// Grant a service ticket and build the redirect back to the service. Services flagged
/// for JWT tickets receive the sealed JWT in place of the raw id.
///
/// # Errors
/// Ticket grant failures, or `InvalidRequest` for an unparsable service URL.
pub async fn redirect_with_ticket(
    state: &AppState,
    tgt_id: &str,
    service: &str,
    registered: &RegisteredService,
    authentication: &Authentication,
) -> Result<Response, CasError> {
    let ticket = state
        .engine()
        .grant_service_ticket(tgt_id, service, registered)
        .await?;
    let value = ticket_value(state, ticket, service, registered, authentication)?;
    found(&with_query_param(service, "ticket", &value)?)
}

fn ticket_value(
    state: &AppState,
    ticket: Ticket,
    service: &str,
    registered: &RegisteredService,
    authentication: &Authentication,
) -> Result<String, CasError> {
    if !registered.jwt_service_ticket {
        return Ok(ticket.id);
    }
    let from_new_login = matches!(
        ticket.data,
        TicketData::Service {
            from_new_login: true,
            ..
        }
    );
    let validated = ValidatedTicket {
        ticket,
        authentication: authentication.clone(),
    };
    let attributes = released_attributes(registered, &validated, from_new_login);
    let ttl = state
        .engine()
        .policies()
        .service_ticket
        .time_to_live_seconds()
        .unwrap_or(DEFAULT_SERVICE_TICKET_TTL_SECONDS);
    state.codec().encode(
        &validated.ticket.id,
        service,
        &validated.ticket.principal_id,
        &authentication.credential_type,
        &attributes,
        ttl,
    )
}

/// `/login` URL that resumes a protocol request at `service`. Requested authentication
/// contexts become the `authn_method` the login step will demand.
///
/// # Errors
/// `InvalidRequest` when a requested context maps to an unavailable provider.
pub fn login_redirect(
    state: &AppState,
    service: &str,
    renew: bool,
    requested_contexts: &[String],
) -> Result<Response, CasError> {
    let registered = state.resolve_service(service);
    let trigger = MfaTrigger {
        requested_method: None,
        service: registered,
        requested_contexts,
    };
    let provider = if requested_contexts.is_empty() {
        None
    } else {
        state.mfa().required_provider(&trigger)?
    };

    let mut url = Url::parse(&format!("{}/login", state.config().server_prefix()))
        .map_err(|err| CasError::Internal(format!("invalid server prefix: {err}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("service", service);
        if renew {
            query.append_pair("renew", "true");
        }
        if let Some(provider) = &provider {
            query.append_pair("authn_method", provider);
        }
    }
    found(url.as_str())
}
