//! Operational endpoints under `/actuator`: ticket registry queries, SSO sessions,
//! policies, registered services and MFA records.

use axum::{
    extract::{Extension, Query},
    http::HeaderMap,
    response::Json,
};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{info, instrument};
use utoipa::{IntoParams, ToSchema};

use crate::{
    api::{session::extract_bearer_token, state::AppState},
    crypto::constant_time_eq,
    engine::TicketStats,
    error::CasError,
    mfa::trusted::TrustedDevice,
    registry::RegisteredService,
    tickets::{ExpirationPolicies, Ticket, TicketData, TicketKind, TicketState},
};

/// Require the configured bearer token; the actuator is open when none is set.
fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), CasError> {
    let Some(expected) = state.config().actuator_token() else {
        return Ok(());
    };
    match extract_bearer_token(headers) {
        Some(token)
            if constant_time_eq(token.as_bytes(), expected.expose_secret().as_bytes()) =>
        {
            Ok(())
        }
        _ => Err(CasError::AuthenticationFailed),
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TicketSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub principal: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u32,
    pub state: TicketState,
    pub expires_at: Option<DateTime<Utc>>,
    pub granting_ticket: Option<String>,
}

impl TicketSummary {
    fn new(ticket: &Ticket, now: DateTime<Utc>) -> Self {
        Self {
            id: ticket.id.clone(),
            kind: ticket.kind().prefix(),
            principal: ticket.principal_id.clone(),
            created_at: ticket.created_at,
            last_used_at: ticket.last_used_at,
            use_count: ticket.use_count,
            state: ticket.state(now),
            expires_at: ticket.expires_at(),
            granting_ticket: ticket.granting_ticket_id.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SsoSession {
    pub ticket_granting_ticket: String,
    pub principal: String,
    pub authentication_date: DateTime<Utc>,
    pub credential_type: String,
    pub mfa_provider: Option<String>,
    pub sso: bool,
    pub services: BTreeSet<String>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SsoSession {
    fn from_ticket(ticket: Ticket) -> Option<Self> {
        let expires_at = ticket.expires_at();
        let TicketData::TicketGranting {
            authentication,
            sso,
            services,
            ..
        } = ticket.data
        else {
            return None;
        };
        Some(Self {
            ticket_granting_ticket: ticket.id,
            principal: ticket.principal_id,
            authentication_date: authentication.auth_time,
            credential_type: authentication.credential_type,
            mfa_provider: authentication.mfa_provider,
            sso,
            services,
            last_used_at: ticket.last_used_at,
            expires_at,
        })
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TicketQuery {
    /// Ticket prefix: `TGT`, `ST`, `PGT`, `PT`, `OC`, `AT`, `RT`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    pub principal: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserQuery {
    pub user: Option<String>,
    /// Single TGT to revoke.
    pub ticket: Option<String>,
}

#[utoipa::path(
    get,
    path = "/actuator/ticketRegistry",
    params(TicketQuery),
    responses((status = 200, description = "Matching tickets", body = [TicketSummary])),
    tag = "actuator",
)]
#[instrument(skip_all)]
pub async fn ticket_registry(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<TicketQuery>,
) -> Result<Json<Vec<TicketSummary>>, CasError> {
    authorize(&headers, &state)?;
    let kind = query
        .kind
        .as_deref()
        .map(str::parse::<TicketKind>)
        .transpose()
        .map_err(CasError::InvalidRequest)?;
    let now = Utc::now();
    let tickets = state
        .engine()
        .tickets(kind, query.principal.as_deref())
        .await?;
    Ok(Json(
        tickets
            .iter()
            .map(|ticket| TicketSummary::new(ticket, now))
            .collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/actuator/ticketRegistry/stats",
    responses((status = 200, description = "Ticket counts", body = TicketStats)),
    tag = "actuator",
)]
pub async fn ticket_stats(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Json<TicketStats>, CasError> {
    authorize(&headers, &state)?;
    Ok(Json(state.engine().stats().await?))
}

#[utoipa::path(
    get,
    path = "/actuator/ssoSessions",
    params(UserQuery),
    responses((status = 200, description = "Active SSO sessions", body = [SsoSession])),
    tag = "actuator",
)]
#[instrument(skip_all)]
pub async fn sso_sessions(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SsoSession>>, CasError> {
    authorize(&headers, &state)?;
    let sessions = state.engine().sessions(query.user.as_deref()).await?;
    Ok(Json(
        sessions
            .into_iter()
            .filter(|ticket| {
                query
                    .ticket
                    .as_deref()
                    .map_or(true, |id| ticket.id == id)
            })
            .filter_map(SsoSession::from_ticket)
            .collect(),
    ))
}

/// Revoke sessions by user or by TGT.
#[instrument(skip_all)]
pub async fn revoke_sso_sessions(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, CasError> {
    authorize(&headers, &state)?;
    let revoked = match (query.ticket.as_deref(), query.user.as_deref()) {
        (Some(ticket), _) => {
            if TicketKind::from_id(ticket) != Some(TicketKind::TicketGranting) {
                return Err(CasError::InvalidTicketSpec(ticket.to_string()));
            }
            usize::from(
                !state
                    .engine()
                    .revoke_ticket_granting_ticket(ticket)
                    .await?
                    .is_empty(),
            )
        }
        (None, Some(user)) => state.engine().revoke_sessions_for(user).await?,
        (None, None) => {
            return Err(CasError::InvalidRequest(
                "user or ticket is required".to_string(),
            ));
        }
    };
    info!(revoked, "revoked SSO sessions");
    Ok(Json(json!({ "revoked": revoked })))
}

#[utoipa::path(
    get,
    path = "/actuator/expirationPolicies",
    responses((status = 200, description = "Expiration policy per ticket type", body = ExpirationPolicies)),
    tag = "actuator",
)]
pub async fn expiration_policies(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Json<ExpirationPolicies>, CasError> {
    authorize(&headers, &state)?;
    Ok(Json(state.engine().policies().clone()))
}

#[utoipa::path(
    get,
    path = "/actuator/registeredServices",
    responses((status = 200, description = "Service registry, secrets omitted", body = [Object])),
    tag = "actuator",
)]
pub async fn registered_services(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Json<Vec<RegisteredService>>, CasError> {
    authorize(&headers, &state)?;
    Ok(Json(state.registry().services().to_vec()))
}

#[utoipa::path(
    get,
    path = "/actuator/gauthCredentials",
    params(UserQuery),
    responses((status = 200, description = "Google Authenticator registrations", body = [Object])),
    tag = "actuator",
)]
pub async fn gauth_credentials(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, CasError> {
    authorize(&headers, &state)?;
    let accounts = state.mfa().gauth().accounts(query.user.as_deref())?;
    serde_json::to_value(accounts)
        .map(Json)
        .map_err(|err| CasError::Internal(err.to_string()))
}

/// Remove a user's Google Authenticator registration.
#[instrument(skip_all)]
pub async fn remove_gauth_credentials(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, CasError> {
    authorize(&headers, &state)?;
    let user = query
        .user
        .ok_or_else(|| CasError::InvalidRequest("user is required".to_string()))?;
    let removed = state.mfa().gauth().remove(&user)?;
    info!(user = %user, removed, "removed gauth registration");
    Ok(Json(json!({ "removed": removed })))
}

#[utoipa::path(
    get,
    path = "/actuator/multifactorTrustedDevices",
    params(UserQuery),
    responses((status = 200, description = "Trusted devices", body = [TrustedDevice])),
    tag = "actuator",
)]
pub async fn trusted_devices(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<TrustedDevice>>, CasError> {
    authorize(&headers, &state)?;
    match state.mfa().trusted_devices() {
        Some(store) => Ok(Json(store.list(query.user.as_deref())?)),
        None => Ok(Json(Vec::new())),
    }
}

/// Forget a user's trusted devices.
#[instrument(skip_all)]
pub async fn revoke_trusted_devices(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, CasError> {
    authorize(&headers, &state)?;
    let user = query
        .user
        .ok_or_else(|| CasError::InvalidRequest("user is required".to_string()))?;
    let revoked = match state.mfa().trusted_devices() {
        Some(store) => store.revoke(&user)?,
        None => 0,
    };
    info!(user = %user, revoked, "revoked trusted devices");
    Ok(Json(json!({ "revoked": revoked })))
}
