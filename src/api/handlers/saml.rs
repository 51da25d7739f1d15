//! SAML2 IdP front-channel: SSO bindings, the post-login callback and metadata.

use axum::{
    Form,
    extract::{Extension, Query},
    http::{HeaderMap, HeaderValue, header},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use utoipa::{IntoParams, ToSchema};

use super::login_redirect;
use crate::{
    api::{
        session::{ClientInfo, session_from},
        state::AppState,
    },
    error::CasError,
    saml::{
        SamlOutcome,
        request::{AuthnRequest, decode_post, decode_redirect},
    },
};

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct SamlParams {
    #[serde(rename = "SAMLRequest")]
    pub saml_request: String,
    #[serde(default, rename = "RelayState")]
    pub relay_state: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackParams {
    #[serde(rename = "SAMLRequest")]
    pub saml_request: String,
    #[serde(default, rename = "RelayState")]
    pub relay_state: Option<String>,
    pub ticket: String,
}

async fn answer(
    headers: &HeaderMap,
    client: &ClientInfo,
    state: &AppState,
    request: &AuthnRequest,
    relay_state: Option<&str>,
) -> Result<Response, CasError> {
    let session = session_from(headers, client, state.cookies());
    match state
        .saml()
        .sso(request, relay_state, session.as_deref())
        .await?
    {
        SamlOutcome::Post(post) => Ok(Html(post.html()).into_response()),
        SamlOutcome::Login {
            service,
            renew,
            requested_contexts,
        } => login_redirect(state, &service, renew, &requested_contexts),
    }
}

#[utoipa::path(
    get,
    path = "/idp/profile/SAML2/Redirect/SSO",
    params(SamlParams),
    responses(
        (status = 200, description = "Auto-posting form carrying the SAML response", content_type = "text/html"),
        (status = 302, description = "Redirect to /login"),
        (status = 403, description = "Unknown service provider"),
    ),
    tag = "saml",
)]
/// HTTP-Redirect binding (deflated `AuthnRequest`).
#[instrument(skip_all)]
pub async fn sso_redirect(
    headers: HeaderMap,
    client: ClientInfo,
    state: Extension<Arc<AppState>>,
    Query(params): Query<SamlParams>,
) -> Result<Response, CasError> {
    let request = decode_redirect(&params.saml_request)?;
    answer(&headers, &client, &state, &request, params.relay_state.as_deref()).await
}

#[utoipa::path(
    post,
    path = "/idp/profile/SAML2/POST/SSO",
    request_body(content = SamlParams, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Auto-posting form carrying the SAML response", content_type = "text/html"),
        (status = 302, description = "Redirect to /login"),
        (status = 403, description = "Unknown service provider"),
    ),
    tag = "saml",
)]
/// HTTP-POST binding.
#[instrument(skip_all)]
pub async fn sso_post(
    headers: HeaderMap,
    client: ClientInfo,
    state: Extension<Arc<AppState>>,
    Form(params): Form<SamlParams>,
) -> Result<Response, CasError> {
    let request = decode_post(&params.saml_request)?;
    answer(&headers, &client, &state, &request, params.relay_state.as_deref()).await
}

#[utoipa::path(
    get,
    path = "/idp/profile/SAML2/Callback",
    params(CallbackParams),
    responses(
        (status = 200, description = "Auto-posting form carrying the SAML response", content_type = "text/html"),
        (status = 400, description = "Ticket is not valid for this request"),
    ),
    tag = "saml",
)]
/// Resume a request once `/login` issued a service ticket for it.
#[instrument(skip_all)]
pub async fn callback(
    state: Extension<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, CasError> {
    match state
        .saml()
        .callback(
            &params.saml_request,
            params.relay_state.as_deref(),
            &params.ticket,
        )
        .await?
    {
        SamlOutcome::Post(post) => Ok(Html(post.html()).into_response()),
        SamlOutcome::Login {
            service,
            renew,
            requested_contexts,
        } => login_redirect(&state, &service, renew, &requested_contexts),
    }
}

#[utoipa::path(
    get,
    path = "/idp/metadata",
    responses(
        (status = 200, description = "IdP entity descriptor", content_type = "application/samlmetadata+xml"),
    ),
    tag = "saml",
)]
pub async fn metadata(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/samlmetadata+xml"),
        )],
        state.saml().metadata(),
    )
}
