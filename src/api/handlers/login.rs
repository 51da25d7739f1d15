//! `/login`: primary authentication, MFA steps and service ticket redirects.

use axum::{
    Form,
    extract::Extension,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use utoipa::{IntoParams, ToSchema};

use super::{authorized_service, empty_as_none, flag, found, mfa_satisfied, redirect_with_ticket};
use crate::{
    api::{
        session::{ClientInfo, session_cookie, session_from},
        state::AppState,
    },
    authn::Credential,
    engine::SessionRequest,
    error::CasError,
    mfa::{
        MfaOutcome, MfaTrigger, TrustRequest,
        flow::FlowState,
        trusted::{TimeUnit, fingerprint},
    },
    tickets::TicketKind,
};

#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct LoginParams {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub service: Option<String>,
    /// Ignore the SSO session and ask for credentials again.
    #[serde(default, deserialize_with = "flag")]
    #[param(value_type = Option<bool>)]
    pub renew: bool,
    /// Never prompt: redirect back without a ticket when there is no session.
    #[serde(default, deserialize_with = "flag")]
    #[param(value_type = Option<bool>)]
    pub gateway: bool,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub authn_method: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct LoginForm {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub service: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub renew: bool,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub authn_method: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub username: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<String>, format = Password)]
    pub password: Option<SecretString>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub client_name: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub assertion: Option<SecretString>,
    /// Flow token of an MFA or trust-device step.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub execution: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub token: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub device_name: Option<String>,
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub time_unit: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub device_id: Option<String>,
}

/// Next step of an unfinished login.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginStep {
    pub step: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub registration: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delegated_clients: Vec<String>,
}

impl LoginStep {
    fn new(step: &'static str) -> Self {
        Self {
            step,
            provider: None,
            execution: None,
            service: None,
            registration: None,
            delegated_clients: Vec::new(),
        }
    }
}

#[utoipa::path(
    get,
    path = "/login",
    params(LoginParams),
    responses(
        (status = 200, description = "Credentials are required", body = LoginStep),
        (status = 302, description = "Redirect to the service with a ticket"),
        (status = 403, description = "Service is not authorized"),
    ),
    tag = "cas",
)]
/// Start a login, or issue a ticket straight from the SSO session.
#[instrument(skip_all, fields(service = params.service.as_deref().unwrap_or("")))]
pub async fn login_page(
    headers: HeaderMap,
    client: ClientInfo,
    state: Extension<Arc<AppState>>,
    Form(params): Form<LoginParams>,
) -> Result<Response, CasError> {
    let registered = params
        .service
        .as_deref()
        .map(|service| authorized_service(&state, service))
        .transpose()?;
    let session = session_from(&headers, &client, state.cookies());

    if let (Some(tgt_id), false) = (session.as_deref(), params.renew) {
        match state
            .engine()
            .find_usable(tgt_id, TicketKind::TicketGranting)
            .await
        {
            Ok(tgt) => {
                let Some(service) = params.service.as_deref() else {
                    let mut step = LoginStep::new("authenticated");
                    step.provider = tgt.authentication.mfa_provider.clone();
                    return Ok(Json(step).into_response());
                };
                let trigger = MfaTrigger {
                    requested_method: params.authn_method.as_deref(),
                    service: registered,
                    requested_contexts: &[],
                };
                let participates = state
                    .engine()
                    .sso()
                    .participates(&tgt.ticket.principal_id, registered);
                if participates && mfa_satisfied(&state, &trigger, &tgt.authentication)? {
                    if let Some(registered) = registered {
                        return redirect_with_ticket(
                            &state,
                            tgt_id,
                            service,
                            registered,
                            &tgt.authentication,
                        )
                        .await;
                    }
                }
                if participates {
                    // step-up on the existing session
                    let device = fingerprint(&client.ip, &client.user_agent, "");
                    let outcome = state.mfa().begin(
                        tgt.authentication,
                        &trigger,
                        Some(&device),
                        params.service.clone(),
                        Some(tgt_id.to_string()),
                    )?;
                    return respond(&state, outcome, &client).await;
                }
            }
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => debug!("Ignoring unusable session: {}", err),
        }
    }

    if params.gateway {
        if let Some(service) = params.service.as_deref() {
            return found(service);
        }
    }

    let mut step = LoginStep::new("credentials");
    step.service = params.service;
    step.provider = params.authn_method;
    step.delegated_clients = state.delegated_clients().to_vec();
    Ok(Json(step).into_response())
}

#[utoipa::path(
    post,
    path = "/login",
    request_body(content = LoginForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Another step is required, or login finished without a service", body = LoginStep),
        (status = 302, description = "Redirect to the service with a ticket"),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account disabled, service refused or concurrent session rejected"),
        (status = 423, description = "Account locked"),
        (status = 429, description = "Too many failed attempts"),
    ),
    tag = "cas",
)]
/// Submit credentials, an MFA token or the trust-device choice.
#[instrument(skip_all)]
pub async fn login(
    headers: HeaderMap,
    client: ClientInfo,
    state: Extension<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Result<Response, CasError> {
    let device = fingerprint(
        &client.ip,
        &client.user_agent,
        form.device_id.as_deref().unwrap_or_default(),
    );

    if let Some(execution) = form.execution.as_deref() {
        let outcome = match form.token.as_deref() {
            Some(token) => state.mfa().submit_token(execution, token).await?,
            None => {
                let request = trust_request(&form)?;
                MfaOutcome::Complete(state.mfa().trust_device(
                    execution,
                    request.as_ref(),
                    &device,
                )?)
            }
        };
        return respond(&state, outcome, &client).await;
    }

    let registered = form
        .service
        .as_deref()
        .map(|service| authorized_service(&state, service))
        .transpose()?;
    let credential = credential(form.username, form.password, form.client_name, form.assertion)?;
    let authentication = state.authn().authenticate(&credential, &client.ip).await?;

    // A credential login always rotates the browser's session, renew or not.
    let replaces = session_from(&headers, &client, state.cookies());
    let trigger = MfaTrigger {
        requested_method: form.authn_method.as_deref(),
        service: registered,
        requested_contexts: &[],
    };
    let outcome = state.mfa().begin(
        authentication,
        &trigger,
        Some(&device),
        form.service,
        replaces,
    )?;
    respond(&state, outcome, &client).await
}

fn credential(
    username: Option<String>,
    password: Option<SecretString>,
    client_name: Option<String>,
    assertion: Option<SecretString>,
) -> Result<Credential, CasError> {
    match (username, password, client_name, assertion) {
        (_, _, Some(client_name), Some(assertion)) => Ok(Credential::Delegated {
            client_name,
            assertion,
        }),
        (Some(username), Some(password), _, _) => Ok(Credential::UsernamePassword {
            username,
            password,
        }),
        _ => Err(CasError::InvalidRequest(
            "username and password, or client_name and assertion, are required".to_string(),
        )),
    }
}

fn trust_request(form: &LoginForm) -> Result<Option<TrustRequest>, CasError> {
    let Some(device_name) = form.device_name.clone() else {
        return Ok(None);
    };
    let unit = form
        .time_unit
        .as_deref()
        .map_or(Ok(TimeUnit::Days), str::parse)?;
    Ok(Some(TrustRequest {
        device_name,
        expiration: form.expiration.unwrap_or(30),
        unit,
    }))
}

async fn respond(
    state: &AppState,
    outcome: MfaOutcome,
    client: &ClientInfo,
) -> Result<Response, CasError> {
    let step = match outcome {
        MfaOutcome::Complete(flow) => return complete(state, flow, client).await,
        MfaOutcome::Challenge {
            provider,
            execution,
        } => {
            let mut step = LoginStep::new("mfa_challenge");
            step.provider = Some(provider);
            step.execution = Some(execution);
            step
        }
        MfaOutcome::Registration {
            provider,
            execution,
            registration,
        } => {
            let mut step = LoginStep::new("mfa_registration");
            step.provider = Some(provider);
            step.execution = Some(execution);
            step.registration = Some(
                serde_json::to_value(&registration)
                    .map_err(|err| CasError::Internal(err.to_string()))?,
            );
            step
        }
        MfaOutcome::TrustDevice { execution } => {
            let mut step = LoginStep::new("trust_device");
            step.execution = Some(execution);
            step
        }
    };
    Ok(Json(step).into_response())
}

/// Create the SSO session for a finished flow and send the browser on.
async fn complete(
    state: &AppState,
    flow: FlowState,
    client: &ClientInfo,
) -> Result<Response, CasError> {
    let FlowState {
        authentication,
        service,
        replaces,
        ..
    } = flow;
    let registered = service
        .as_deref()
        .map(|service| authorized_service(state, service))
        .transpose()?;
    let sso = state
        .engine()
        .sso()
        .participates(&authentication.principal.id, registered);

    let tgt = state
        .engine()
        .create_ticket_granting_ticket(
            authentication.clone(),
            &SessionRequest::new()
                .with_service(service.clone())
                .with_sso(sso)
                .replacing(replaces),
        )
        .await?;
    info!(
        principal = %tgt.principal_id,
        credential = %authentication.credential_type,
        sso,
        "login succeeded"
    );
    let authentication = tgt.authentication().cloned().unwrap_or(authentication);

    let mut response = match (service.as_deref(), registered) {
        (Some(service), Some(registered)) => {
            redirect_with_ticket(state, &tgt.id, service, registered, &authentication).await?
        }
        _ => (
            StatusCode::OK,
            Json(json!({
                "step": "complete",
                "principal": tgt.principal_id,
                "authenticationDate": authentication.auth_time,
                "mfaProvider": authentication.mfa_provider,
            })),
        )
            .into_response(),
    };

    if sso {
        let cookie = session_cookie(
            &tgt.id,
            client,
            state.cookies(),
            state.config().secure_cookies(),
        )
        .map_err(|err| CasError::Internal(err.to_string()))?;
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    Ok(response)
}
