//! OAuth2 / OpenID Connect endpoints under `/oidc`.

use axum::{
    Form,
    extract::{Extension, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;

use super::{found, login_redirect};
use crate::{
    api::{
        session::{ClientInfo, extract_bearer_token, session_from},
        state::AppState,
    },
    error::CasError,
    oidc::{AuthorizeOutcome, AuthorizeRequest, TokenRequest, TokenResponse},
};

/// RFC 6749 error body.
#[derive(Debug, Serialize, ToSchema)]
pub struct OAuthError {
    pub error: &'static str,
    pub error_description: String,
}

fn oauth_error(err: &CasError) -> Response {
    let status = match err {
        CasError::InvalidClient => StatusCode::UNAUTHORIZED,
        err if err.is_retryable() || matches!(err, CasError::Internal(_)) => err.status(),
        _ => StatusCode::BAD_REQUEST,
    };
    if let CasError::Internal(detail) = err {
        tracing::error!("Internal error: {}", detail);
    }
    (
        status,
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(OAuthError {
            error: err.oauth_code(),
            error_description: err.to_string(),
        }),
    )
        .into_response()
}

/// Credentials from `Authorization: Basic`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

#[utoipa::path(
    get,
    path = "/oidc/authorize",
    params(AuthorizeRequest),
    responses(
        (status = 302, description = "Redirect to the client, or to /login when authentication is needed"),
        (status = 400, description = "Unknown client or unregistered redirect URI", body = OAuthError),
    ),
    tag = "oidc",
)]
/// Authorization endpoint (code flow, PKCE, `prompt=login`, `max_age`).
#[instrument(skip_all, fields(client_id = %request.client_id))]
pub async fn authorize(
    headers: HeaderMap,
    client: ClientInfo,
    state: Extension<Arc<AppState>>,
    Query(request): Query<AuthorizeRequest>,
) -> Response {
    let session = session_from(&headers, &client, state.cookies());
    let outcome = match state.oidc().authorize(&request, session.as_deref()).await {
        Ok(outcome) => outcome,
        Err(err) => return oauth_error(&err),
    };
    let redirect = match outcome {
        AuthorizeOutcome::Redirect(location) => found(&location),
        AuthorizeOutcome::Login {
            service,
            renew,
            requested_contexts,
        } => login_redirect(&state, &service, renew, &requested_contexts),
    };
    redirect.unwrap_or_else(|err| oauth_error(&err))
}

#[utoipa::path(
    post,
    path = "/oidc/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens", body = TokenResponse),
        (status = 400, description = "Invalid grant or request", body = OAuthError),
        (status = 401, description = "Client authentication failed", body = OAuthError),
    ),
    tag = "oidc",
)]
/// Token endpoint: `authorization_code`, `refresh_token` and `client_credentials` grants.
#[instrument(skip_all, fields(grant_type = %request.grant_type))]
pub async fn token(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Form(request): Form<TokenRequest>,
) -> Response {
    match state
        .oidc()
        .token(&request, basic_credentials(&headers))
        .await
    {
        Ok(tokens) => (
            StatusCode::OK,
            [
                (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
                (header::PRAGMA, HeaderValue::from_static("no-cache")),
            ],
            Json(tokens),
        )
            .into_response(),
        Err(err) => {
            debug!(error = err.oauth_code(), "token request refused: {}", err);
            oauth_error(&err)
        }
    }
}

#[utoipa::path(
    get,
    path = "/oidc/profile",
    responses(
        (status = 200, description = "Claims of the access token's subject", body = Object),
        (status = 401, description = "Missing or invalid access token"),
    ),
    security(("bearer" = [])),
    tag = "oidc",
)]
/// UserInfo endpoint.
#[instrument(skip_all)]
pub async fn profile(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    let Some(access_token) = extract_bearer_token(&headers) else {
        return invalid_token("missing bearer token");
    };
    match state.oidc().userinfo(&access_token).await {
        Ok(claims) => Json(Value::Object(claims)).into_response(),
        Err(err) if err.is_retryable() => oauth_error(&err),
        Err(err) => {
            debug!("userinfo refused: {}", err);
            invalid_token("access token is not valid")
        }
    }
}

fn invalid_token(description: &str) -> Response {
    let challenge = format!("Bearer error=\"invalid_token\", error_description=\"{description}\"");
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(OAuthError {
            error: "invalid_token",
            error_description: description.to_string(),
        }),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

#[utoipa::path(
    get,
    path = "/oidc/.well-known/openid-configuration",
    responses((status = 200, description = "Provider metadata", body = Object)),
    tag = "oidc",
)]
pub async fn discovery(state: Extension<Arc<AppState>>) -> Json<Value> {
    Json(state.oidc().discovery())
}

#[utoipa::path(
    get,
    path = "/oidc/jwks",
    responses((status = 200, description = "Public signing keys", body = Object)),
    tag = "oidc",
)]
pub async fn jwks(state: Extension<Arc<AppState>>) -> Json<Value> {
    Json(state.oidc().jwks())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_are_decoded() {
        let mut headers = HeaderMap::new();
        let encoded = STANDARD.encode("client:s3cr:et");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        assert_eq!(
            basic_credentials(&headers),
            Some(("client".to_string(), "s3cr:et".to_string()))
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic !!!"));
        assert!(basic_credentials(&headers).is_none());
    }

    #[test]
    fn oauth_errors_are_not_cached() {
        let response = oauth_error(&CasError::InvalidGrant("OC-1 is not valid".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
        assert_eq!(
            oauth_error(&CasError::InvalidClient).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
