mod common;

use anyhow::{Context, Result, ensure};
use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use common::{ACTUATOR_TOKEN, body_json, get, send};
use serde_json::Value;

const APP_SERVICE: &str = "https://app.example.org/home";

fn actuator(method: Method, uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ACTUATOR_TOKEN}"))
        .body(Body::empty())?)
}

async fn json(app: &axum::Router, method: Method, uri: &str) -> Result<Value> {
    let response = send(app, actuator(method, uri)?).await?;
    ensure!(response.status() == StatusCode::OK, "{uri}: {}", response.status());
    body_json(response).await
}

#[tokio::test]
async fn health_reports_the_store() -> Result<()> {
    let (app, _state) = common::app()?;
    let response = send(&app, get("/health", None)?).await?;
    ensure!(response.status() == StatusCode::OK);
    ensure!(response.headers().contains_key("x-app"));
    let health = body_json(response).await?;
    ensure!(health["name"] == env!("CARGO_PKG_NAME"), "{health}");
    ensure!(health["store"] == "ok", "{health}");

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/health")
        .body(Body::empty())?;
    let response = send(&app, request).await?;
    ensure!(response.status() == StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn requests_carry_a_request_id() -> Result<()> {
    let (app, _state) = common::app()?;
    let response = send(&app, get("/health", None)?).await?;
    ensure!(response.headers().contains_key("x-request-id"));
    Ok(())
}

#[tokio::test]
async fn bearer_token_is_required() -> Result<()> {
    let (app, _state) = common::app()?;
    let response = send(&app, get("/actuator/ticketRegistry", None)?).await?;
    ensure!(response.status() == StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/actuator/ssoSessions")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())?;
    let response = send(&app, request).await?;
    ensure!(response.status() == StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn open_without_a_configured_token() -> Result<()> {
    let config = common::config().with_actuator_token(None);
    let (app, _state) = common::app_with(config)?;
    let response = send(&app, get("/actuator/expirationPolicies", None)?).await?;
    ensure!(response.status() == StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn ticket_registry_lists_and_counts_tickets() -> Result<()> {
    let (app, _state) = common::app()?;
    common::login(&app, APP_SERVICE).await?;

    let tickets = json(&app, Method::GET, "/actuator/ticketRegistry").await?;
    let tickets = tickets.as_array().context("expected a list")?;
    ensure!(tickets.iter().any(|ticket| ticket["type"] == "TGT"));
    ensure!(tickets.iter().any(|ticket| ticket["type"] == "ST"));

    let granting = json(&app, Method::GET, "/actuator/ticketRegistry?type=TGT").await?;
    let granting = granting.as_array().context("expected a list")?;
    ensure!(granting.len() == 1, "{granting:?}");
    ensure!(granting[0]["principal"] == "casuser");

    let response = send(&app, actuator(Method::GET, "/actuator/ticketRegistry?type=XYZ")?).await?;
    ensure!(response.status() == StatusCode::BAD_REQUEST);

    let stats = json(&app, Method::GET, "/actuator/ticketRegistry/stats").await?;
    ensure!(stats["unexpiredTgts"] == 1, "{stats}");
    ensure!(stats["unexpiredSts"] == 1, "{stats}");
    Ok(())
}

#[tokio::test]
async fn sso_sessions_can_be_revoked_by_user() -> Result<()> {
    let (app, _state) = common::app()?;
    common::login(&app, APP_SERVICE).await?;

    let sessions = json(&app, Method::GET, "/actuator/ssoSessions?user=casuser").await?;
    let sessions = sessions.as_array().context("expected a list")?;
    ensure!(sessions.len() == 1, "{sessions:?}");
    ensure!(sessions[0]["principal"] == "casuser");
    let tgt = sessions[0]["ticketGrantingTicket"]
        .as_str()
        .context("ticket missing")?;
    ensure!(tgt.starts_with("TGT-"));
    ensure!(sessions[0]["services"][0] == APP_SERVICE, "{sessions:?}");

    let revoked = json(&app, Method::DELETE, "/actuator/ssoSessions?user=casuser").await?;
    ensure!(revoked["revoked"] == 1, "{revoked}");

    let sessions = json(&app, Method::GET, "/actuator/ssoSessions").await?;
    ensure!(sessions.as_array().is_some_and(Vec::is_empty), "{sessions}");

    let response = send(&app, actuator(Method::DELETE, "/actuator/ssoSessions")?).await?;
    ensure!(response.status() == StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn registered_services_hide_client_secrets() -> Result<()> {
    let (app, _state) = common::app()?;
    let services = json(&app, Method::GET, "/actuator/registeredServices").await?;
    ensure!(services.as_array().is_some_and(|list| list.len() == 6), "{services}");
    ensure!(!services.to_string().contains("client-secret"), "{services}");

    let policies = json(&app, Method::GET, "/actuator/expirationPolicies").await?;
    ensure!(policies.is_object(), "{policies}");
    Ok(())
}

#[tokio::test]
async fn trusted_devices_are_empty_when_disabled() -> Result<()> {
    let (app, _state) = common::app()?;
    let devices = json(&app, Method::GET, "/actuator/multifactorTrustedDevices").await?;
    ensure!(devices.as_array().is_some_and(Vec::is_empty), "{devices}");

    let revoked = json(
        &app,
        Method::DELETE,
        "/actuator/multifactorTrustedDevices?user=casuser",
    )
    .await?;
    ensure!(revoked["revoked"] == 0, "{revoked}");
    Ok(())
}
