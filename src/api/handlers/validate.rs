//! CAS validation endpoints. Failures are protocol responses, not HTTP errors: only
//! retryable failures change the status code.

use axum::{
    Form,
    extract::Extension,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::{IntoParams, ToSchema};

use super::{empty_as_none, flag};
use crate::{
    api::state::AppState,
    error::CasError,
    validation::{
        ValidationEndpoint, ValidationRequest,
        response::{self, ResponseFormat},
    },
};

#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct ValidateParams {
    #[serde(default)]
    pub ticket: String,
    #[serde(default)]
    pub service: String,
    /// HTTPS callback receiving a proxy-granting ticket.
    #[serde(default, rename = "pgtUrl", deserialize_with = "empty_as_none")]
    pub pgt_url: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    #[param(value_type = Option<bool>)]
    pub renew: bool,
    /// `XML` (default) or `JSON`.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub format: Option<String>,
}

impl ValidateParams {
    fn request(&self, endpoint: ValidationEndpoint) -> ValidationRequest {
        ValidationRequest {
            ticket: self.ticket.trim().to_string(),
            service: self.service.trim().to_string(),
            pgt_url: self.pgt_url.clone(),
            renew: self.renew,
            endpoint,
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct ProxyParams {
    #[serde(default)]
    pub pgt: String,
    #[serde(default, rename = "targetService")]
    pub target_service: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub format: Option<String>,
}

fn status_for(err: &CasError) -> StatusCode {
    if err.is_retryable() {
        err.status()
    } else {
        StatusCode::OK
    }
}

fn rendered(status: StatusCode, content_type: &'static str, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        body,
    )
        .into_response()
}

async fn service_response(
    state: &AppState,
    params: &ValidateParams,
    endpoint: ValidationEndpoint,
) -> Response {
    let format = match params.format.as_deref().map(str::parse::<ResponseFormat>) {
        None => ResponseFormat::Xml,
        Some(Ok(format)) => format,
        Some(Err(err)) => {
            return rendered(
                StatusCode::OK,
                ResponseFormat::Xml.content_type(),
                response::service_failure(&err, ResponseFormat::Xml),
            );
        }
    };

    match state.validator().validate(&params.request(endpoint)).await {
        Ok(success) => rendered(
            StatusCode::OK,
            format.content_type(),
            response::service_success(&success, format),
        ),
        Err(err) => {
            debug!(code = err.cas_code(), "validation failed: {}", err);
            rendered(
                status_for(&err),
                format.content_type(),
                response::service_failure(&err, format),
            )
        }
    }
}

#[utoipa::path(
    get,
    path = "/serviceValidate",
    params(ValidateParams),
    responses(
        (status = 200, description = "CAS 2 serviceResponse (XML or JSON)", content_type = "application/xml"),
        (status = 503, description = "Ticket store is unavailable"),
    ),
    tag = "cas",
)]
/// Validate a service ticket. Proxy tickets are refused.
#[instrument(skip_all)]
pub async fn service_validate(
    state: Extension<Arc<AppState>>,
    Form(params): Form<ValidateParams>,
) -> Response {
    service_response(&state, &params, ValidationEndpoint::Service).await
}

#[utoipa::path(
    get,
    path = "/p3/serviceValidate",
    params(ValidateParams),
    responses(
        (status = 200, description = "CAS 3 serviceResponse with attributes", content_type = "application/xml"),
        (status = 503, description = "Ticket store is unavailable"),
    ),
    tag = "cas",
)]
/// CAS 3 service ticket validation.
#[instrument(skip_all)]
pub async fn p3_service_validate(
    state: Extension<Arc<AppState>>,
    Form(params): Form<ValidateParams>,
) -> Response {
    service_response(&state, &params, ValidationEndpoint::Service).await
}

#[utoipa::path(
    get,
    path = "/proxyValidate",
    params(ValidateParams),
    responses(
        (status = 200, description = "CAS 2 serviceResponse with the proxy chain", content_type = "application/xml"),
        (status = 503, description = "Ticket store is unavailable"),
    ),
    tag = "cas",
)]
/// Validate a service or proxy ticket.
#[instrument(skip_all)]
pub async fn proxy_validate(
    state: Extension<Arc<AppState>>,
    Form(params): Form<ValidateParams>,
) -> Response {
    service_response(&state, &params, ValidationEndpoint::Proxy).await
}

#[utoipa::path(
    get,
    path = "/p3/proxyValidate",
    params(ValidateParams),
    responses(
        (status = 200, description = "CAS 3 serviceResponse with the proxy chain", content_type = "application/xml"),
        (status = 503, description = "Ticket store is unavailable"),
    ),
    tag = "cas",
)]
#[instrument(skip_all)]
pub async fn p3_proxy_validate(
    state: Extension<Arc<AppState>>,
    Form(params): Form<ValidateParams>,
) -> Response {
    service_response(&state, &params, ValidationEndpoint::Proxy).await
}

#[utoipa::path(
    get,
    path = "/validate",
    params(ValidateParams),
    responses(
        (status = 200, description = "`yes\\n<user>\\n` or `no\\n\\n`", content_type = "text/plain"),
    ),
    tag = "cas",
)]
/// CAS 1 validation.
#[instrument(skip_all)]
pub async fn validate(
    state: Extension<Arc<AppState>>,
    Form(params): Form<ValidateParams>,
) -> Response {
    let result = state
        .validator()
        .validate(&params.request(ValidationEndpoint::Cas1))
        .await;
    let status = result.as_ref().err().map_or(StatusCode::OK, status_for);
    rendered(
        status,
        "text/plain;charset=UTF-8",
        response::cas1(result.as_ref()),
    )
}

#[utoipa::path(
    get,
    path = "/proxy",
    params(ProxyParams),
    responses(
        (status = 200, description = "proxySuccess with a PT, or proxyFailure", content_type = "application/xml"),
    ),
    tag = "cas",
)]
/// Issue a proxy ticket from a proxy-granting ticket.
#[instrument(skip_all)]
pub async fn proxy(
    state: Extension<Arc<AppState>>,
    Form(params): Form<ProxyParams>,
) -> Response {
    let format = params
        .format
        .as_deref()
        .and_then(|format| format.parse::<ResponseFormat>().ok())
        .unwrap_or_default();
    match state
        .validator()
        .proxy(params.pgt.trim(), params.target_service.trim())
        .await
    {
        Ok(proxy_ticket) => rendered(
            StatusCode::OK,
            format.content_type(),
            response::proxy_success(&proxy_ticket, format),
        ),
        Err(err) => rendered(
            status_for(&err),
            format.content_type(),
            response::proxy_failure(&err, format),
        ),
    }
}
