use axum::{
    Form,
    extract::Extension,
    http::{HeaderMap, header},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use utoipa::{IntoParams, ToSchema};

use super::{authorized_service, empty_as_none, found};
use crate::{
    api::{
        session::{ClientInfo, clear_session_cookie, session_from},
        state::AppState,
    },
    error::CasError,
};

#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct LogoutParams {
    /// Where to send the browser afterwards; must be a registered service.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub service: Option<String>,
}

#[utoipa::path(
    get,
    path = "/logout",
    params(LogoutParams),
    responses(
        (status = 200, description = "Session ended"),
        (status = 302, description = "Session ended, redirect to the service"),
    ),
    tag = "cas",
)]
/// End the SSO session: revoke the TGT with every descendant and clear `TGC`.
#[instrument(skip_all)]
pub async fn logout(
    headers: HeaderMap,
    client: ClientInfo,
    state: Extension<Arc<AppState>>,
    Form(params): Form<LogoutParams>,
) -> Result<Response, CasError> {
    let revoked = match session_from(&headers, &client, state.cookies()) {
        Some(tgt_id) => {
            let revoked = state.engine().revoke_ticket_granting_ticket(&tgt_id).await?;
            info!(tgt = %tgt_id, revoked = revoked.len(), "logged out");
            revoked
        }
        None => Vec::new(),
    };

    let redirect = params.service.as_deref().filter(|service| {
        let allowed = authorized_service(&state, service).is_ok();
        if !allowed {
            debug!(service, "not redirecting to an unauthorized service");
        }
        allowed
    });
    let mut response = match redirect {
        Some(service) => found(service)?,
        None => Json(json!({
            "loggedOut": true,
            "revoked": revoked.len(),
        }))
        .into_response(),
    };
    response.headers_mut().append(
        header::SET_COOKIE,
        clear_session_cookie(state.config().secure_cookies()),
    );
    Ok(response)
}
